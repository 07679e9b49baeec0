//! # Model Service
//!
//! Owns every live document and turns closures over them into atomic,
//! undoable transactions.
//!
//! ## Transactions
//!
//! ```text
//! transform(label, f)
//!   depth 0 → snapshot versions, before_mutation, open captures + recorder
//!   f(&mut Transaction)                 ← nested transform() only bumps depth
//!   depth 0 → group patches by document
//!             after_mutation (version bump + event) per document
//!             close captures, stamp stack items
//!             push ONE HistoryEntry for every document that changed
//! ```
//!
//! - `change_without_history` runs the same wrapper. At the outermost level
//!   its captures are untracked, so it never produces history.
//! - Callback errors are logged and returned. The depth always balances.
//!   With [`ErrorPolicy::Rollback`] the whole outer transaction is undone in
//!   the stores; with [`ErrorPolicy::CommitPartial`] what was written is
//!   committed.
//! - One history entry can span several documents; it is undone and redone
//!   as a unit. If one document fails to step, the documents already stepped
//!   are stepped back and the entry stays where it was.
//! - After each document steps, subtrees left without a parent are removed
//!   outside of history.
//!
//! ## Sessions
//!
//! A gesture (a drag, a typing burst) spans several events but should undo
//! as one step:
//!
//! ```text
//! fork(label, cursor)        → SessionId
//! add(id, f) ...             each call is a transaction, none becomes history
//! commit_and_merge(id, cur)  → ONE HistoryEntry holding every add
//! checkout(id)               → revert every add, drop the session
//! ```
//!
//! A plain transform, undo or redo commits an open session first.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut scopes = ScopeRegistry::new();
//! let page = scopes.intern(["", "page"]);
//! let mut service = ModelService::new(EditorConfig::default());
//! service.create_document(&page)?;
//!
//! let id = service.transform("Add block", |tx| {
//!     tx.tree(&page)?.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block())
//! })?;
//!
//! service.undo()?;
//! ```

use crate::config::{EditorConfig, ErrorPolicy};
use crate::errors::EditorError;
use crate::memory_store::MemoryStore;
use crate::node::Node;
use crate::node_tree::{NodeTree, TreeMut};
use crate::participants::{ChangeParticipant, ModelChange, ParticipantId, ParticipantRegistry};
use crate::store::{ObserverId, SharedDocumentStore, StoreObserver};
use crate::tracker::{DocumentId, Patch, PatchRecorder};
use crate::undo_redo::{ContentChangedEvent, ContentListener, ListenerId, UndoRedoStack};
use canvas_common::{Scope, ScopedIdentifier};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, error, info, instrument, warn};

/// One document's part of a history entry
#[derive(Debug, Clone)]
pub struct EditStackEntry {
    pub document: DocumentId,
    pub scope: Scope,
    pub version_before: u64,
    pub version_after: u64,
    pub cursor_before: Vec<ScopedIdentifier>,
    pub cursor_after: Vec<ScopedIdentifier>,
    pub patches: Vec<Patch>,
}

impl fmt::Display for EditStackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let patches: Vec<String> = self.patches.iter().map(ToString::to_string).collect();
        write!(f, "{}: {}", self.scope, patches.join(", "))
    }
}

/// One undo step: every document a transaction changed
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub label: String,
    pub entries: Vec<EditStackEntry>,
}

impl HistoryEntry {
    /// Store stack items this entry owns in `document`
    pub fn parts_in(&self, document: DocumentId) -> usize {
        self.entries.iter().filter(|e| e.document == document).count()
    }
}

/// Handle of an open gesture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    label: String,
    cursor_before: Vec<ScopedIdentifier>,
    parts: Vec<EditStackEntry>,
}

/// A document: its tree and its version bookkeeping
#[derive(Debug)]
pub struct DocumentModel {
    tree: NodeTree,
    history: UndoRedoStack,
}

impl DocumentModel {
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn history(&self) -> &UndoRedoStack {
        &self.history
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryMode {
    Tracked,
    Untracked,
    /// Tracked, but parts collect in the open session
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Undo,
    Redo,
}

impl Step {
    fn reverse(self) -> Self {
        match self {
            Step::Undo => Step::Redo,
            Step::Redo => Step::Undo,
        }
    }
}

pub type StoreFactory = Box<dyn Fn() -> Box<dyn SharedDocumentStore>>;

fn memory_store() -> Box<dyn SharedDocumentStore> {
    Box::new(MemoryStore::new())
}

pub struct ModelService {
    config: EditorConfig,
    documents: BTreeMap<DocumentId, DocumentModel>,
    by_scope: HashMap<Scope, DocumentId>,
    next_document: u32,
    depth: usize,
    recorder: PatchRecorder,
    versions_before: HashMap<DocumentId, u64>,
    undo_stack: Vec<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    session: Option<Session>,
    next_session: u64,
    participants: ParticipantRegistry,
    store_factory: StoreFactory,
}

/// Handle passed to transaction callbacks
pub struct Transaction<'a> {
    service: &'a mut ModelService,
}

impl Transaction<'_> {
    /// Mutable tree of `scope`
    pub fn tree(&mut self, scope: &Scope) -> Result<TreeMut<'_>, EditorError> {
        let service = &mut *self.service;
        let id = service.document_id(scope)?;
        let model = service
            .documents
            .get_mut(&id)
            .ok_or_else(|| EditorError::ScopeNotFound(scope.to_string()))?;
        Ok(TreeMut::new(
            &mut model.tree,
            &mut service.recorder,
            &service.config,
        ))
    }

    /// Read-only tree of `scope`
    pub fn read(&self, scope: &Scope) -> Result<&NodeTree, EditorError> {
        self.service.tree(scope)
    }

    pub fn depth(&self) -> usize {
        self.service.depth
    }

    pub fn is_updating(&self) -> bool {
        self.service.is_updating()
    }

    /// Nested transaction; joins the enclosing batch
    pub fn transform<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.service.run_nested("transform", f)
    }

    /// Nested history-less change; joins the enclosing batch
    pub fn change_without_history<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.service.run_nested("change_without_history", f)
    }
}

impl ModelService {
    pub fn new(config: EditorConfig) -> Self {
        Self::with_store_factory(config, Box::new(memory_store))
    }

    /// Service whose new documents get their store from `factory`
    pub fn with_store_factory(config: EditorConfig, factory: StoreFactory) -> Self {
        Self {
            config,
            documents: BTreeMap::new(),
            by_scope: HashMap::new(),
            next_document: 0,
            depth: 0,
            recorder: PatchRecorder::new(),
            versions_before: HashMap::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            session: None,
            next_session: 0,
            participants: ParticipantRegistry::new(),
            store_factory: factory,
        }
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    // ── Documents ────────────────────────────────────────────────

    fn allocate(&mut self, scope: &Scope) -> Result<DocumentId, EditorError> {
        if self.by_scope.contains_key(scope) {
            return Err(EditorError::DocumentExists(scope.to_string()));
        }
        let id = DocumentId(self.next_document);
        self.next_document += 1;
        Ok(id)
    }

    fn register(&mut self, scope: &Scope, tree: NodeTree) -> DocumentId {
        let id = tree.document();
        self.by_scope.insert(scope.clone(), id);
        self.documents.insert(
            id,
            DocumentModel {
                tree,
                history: UndoRedoStack::new(),
            },
        );
        info!(scope = %scope, document = %id, "Created document");
        id
    }

    /// New document for `scope` holding only a root node
    pub fn create_document(&mut self, scope: &Scope) -> Result<DocumentId, EditorError> {
        let store = (self.store_factory)();
        self.create_document_in(scope, store)
    }

    /// New document for `scope` backed by `store`. Existing content is kept.
    pub fn create_document_in(
        &mut self,
        scope: &Scope,
        store: Box<dyn SharedDocumentStore>,
    ) -> Result<DocumentId, EditorError> {
        let id = self.allocate(scope)?;
        let tree = NodeTree::new(scope.clone(), id, store)?;
        Ok(self.register(scope, tree))
    }

    /// New document for `scope` seeded with `nodes`. The seed is not undoable.
    pub fn create_document_with(
        &mut self,
        scope: &Scope,
        nodes: Vec<Node>,
    ) -> Result<DocumentId, EditorError> {
        let id = self.allocate(scope)?;
        let store = (self.store_factory)();
        let tree = NodeTree::with_nodes(scope.clone(), id, store, nodes)?;
        Ok(self.register(scope, tree))
    }

    /// Drop the document of `scope`. History entries that touch it skip it
    /// from now on.
    pub fn destroy_document(&mut self, scope: &Scope) -> Result<(), EditorError> {
        let id = self
            .by_scope
            .remove(scope)
            .ok_or_else(|| EditorError::ScopeNotFound(scope.to_string()))?;
        self.documents.remove(&id);
        info!(scope = %scope, document = %id, "Destroyed document");
        Ok(())
    }

    fn document_id(&self, scope: &Scope) -> Result<DocumentId, EditorError> {
        self.by_scope
            .get(scope)
            .copied()
            .ok_or_else(|| EditorError::ScopeNotFound(scope.to_string()))
    }

    pub fn document(&self, scope: &Scope) -> Result<&DocumentModel, EditorError> {
        let id = self.document_id(scope)?;
        self.documents
            .get(&id)
            .ok_or_else(|| EditorError::ScopeNotFound(scope.to_string()))
    }

    fn document_mut(&mut self, scope: &Scope) -> Result<&mut DocumentModel, EditorError> {
        let id = self.document_id(scope)?;
        self.documents
            .get_mut(&id)
            .ok_or_else(|| EditorError::ScopeNotFound(scope.to_string()))
    }

    pub fn tree(&self, scope: &Scope) -> Result<&NodeTree, EditorError> {
        self.document(scope).map(DocumentModel::tree)
    }

    /// Scopes of every live document, in creation order
    pub fn documents(&self) -> Vec<Scope> {
        self.documents
            .values()
            .map(|model| model.tree.scope().clone())
            .collect()
    }

    pub fn on_content_changed(
        &mut self,
        scope: &Scope,
        listener: ContentListener,
    ) -> Result<ListenerId, EditorError> {
        Ok(self.document_mut(scope)?.history.on_content_changed(listener))
    }

    pub fn remove_content_listener(
        &mut self,
        scope: &Scope,
        id: ListenerId,
    ) -> Result<bool, EditorError> {
        Ok(self.document_mut(scope)?.history.remove_listener(id))
    }

    /// Deep observer on the store of `scope`
    pub fn observe_deep(
        &mut self,
        scope: &Scope,
        observer: StoreObserver,
    ) -> Result<ObserverId, EditorError> {
        Ok(self
            .document_mut(scope)?
            .tree
            .store_mut()
            .observe_deep(observer))
    }

    pub fn add_change_participant(
        &mut self,
        participant: Box<dyn ChangeParticipant>,
    ) -> ParticipantId {
        self.participants.add(participant)
    }

    pub fn remove_change_participant(&mut self, id: ParticipantId) -> bool {
        self.participants.remove(id)
    }

    // ── Transactions ─────────────────────────────────────────────

    pub fn is_updating(&self) -> bool {
        self.depth > 0
    }

    pub fn transform<R>(
        &mut self,
        label: &str,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.run(label, HistoryMode::Tracked, Vec::new(), f, |_| Vec::new())
    }

    /// Transaction recording the cursor before and, via `cursor_after`,
    /// after the change
    pub fn transform_with_cursor<R>(
        &mut self,
        label: &str,
        cursor_before: Vec<ScopedIdentifier>,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
        cursor_after: impl FnOnce(&ModelService) -> Vec<ScopedIdentifier>,
    ) -> Result<R, EditorError> {
        self.run(label, HistoryMode::Tracked, cursor_before, f, cursor_after)
    }

    /// `transform` that runs `f` again after a transient failure, at most
    /// `transient_retries` more times. Transient failures happen before
    /// anything is written.
    pub fn transform_with_retry<R>(
        &mut self,
        label: &str,
        mut f: impl FnMut(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        let mut attempt = 0;
        loop {
            match self.transform(label, &mut f) {
                Err(err) if err.is_transient() && attempt < self.config.transient_retries => {
                    attempt += 1;
                    warn!(label, attempt, error = %err, "Retrying transaction");
                }
                result => return result,
            }
        }
    }

    /// Change that never becomes an undo step
    pub fn change_without_history<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.run(
            "change_without_history",
            HistoryMode::Untracked,
            Vec::new(),
            f,
            |_| Vec::new(),
        )
    }

    fn run_nested<R>(
        &mut self,
        kind: &str,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.depth += 1;
        debug!(kind, depth = self.depth, "Nested transaction");
        let result = f(&mut Transaction { service: &mut *self });
        self.depth -= 1;
        if let Err(err) = &result {
            error!(kind, depth = self.depth, error = %err, "Nested transaction failed");
        }
        result
    }

    #[instrument(skip(self, cursor_before, f, cursor_after))]
    fn run<R>(
        &mut self,
        label: &str,
        mode: HistoryMode,
        cursor_before: Vec<ScopedIdentifier>,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
        cursor_after: impl FnOnce(&ModelService) -> Vec<ScopedIdentifier>,
    ) -> Result<R, EditorError> {
        debug_assert_eq!(self.depth, 0);
        if mode == HistoryMode::Tracked {
            self.commit_open_session();
        }
        self.begin(mode)?;

        self.depth += 1;
        let result = f(&mut Transaction { service: &mut *self });
        self.depth -= 1;

        if let Err(err) = &result {
            error!(label, error = %err, "Transaction callback failed");
        }
        let rollback = result.is_err() && self.config.error_policy == ErrorPolicy::Rollback;
        let cursor_after = if rollback {
            Vec::new()
        } else {
            cursor_after(self)
        };

        let finished = self.finish(label, mode, rollback, cursor_before, cursor_after);
        match (result, finished) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(finish_err)) => {
                error!(label, error = %finish_err, "Closing failed transaction also failed");
                Err(err)
            }
        }
    }

    fn begin(&mut self, mode: HistoryMode) -> Result<(), EditorError> {
        let tracked = mode != HistoryMode::Untracked;
        let mut opened: Vec<DocumentId> = Vec::new();
        let mut failure = None;
        for (id, model) in self.documents.iter_mut() {
            match model.tree.store_mut().begin_capture(tracked) {
                Ok(()) => opened.push(*id),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            for id in &opened {
                if let Some(model) = self.documents.get_mut(id) {
                    model.tree.store_mut().rollback_capture()?;
                }
            }
            return Err(err.into());
        }

        self.versions_before = self
            .documents
            .iter()
            .map(|(id, model)| (*id, model.history.alternative_version_id()))
            .collect();
        for model in self.documents.values_mut() {
            model.history.before_mutation();
        }
        self.recorder.open();
        Ok(())
    }

    fn finish(
        &mut self,
        label: &str,
        mode: HistoryMode,
        rollback: bool,
        cursor_before: Vec<ScopedIdentifier>,
        cursor_after: Vec<ScopedIdentifier>,
    ) -> Result<(), EditorError> {
        let patches = self.recorder.close();
        let mut by_document: BTreeMap<DocumentId, Vec<Patch>> = BTreeMap::new();
        for patch in patches {
            by_document.entry(patch.document).or_default().push(patch);
        }

        let mut first_error = None;
        if rollback {
            for model in self.documents.values_mut() {
                if let Err(err) = model.tree.store_mut().rollback_capture() {
                    first_error.get_or_insert(EditorError::from(err));
                }
                model.history.after_mutation(&[]);
            }
            warn!(label, "Transaction rolled back");
            return first_error.map_or(Ok(()), Err);
        }

        let mut entries = Vec::new();
        for (id, model) in self.documents.iter_mut() {
            let patches = by_document.remove(id).unwrap_or_default();
            let event = model.history.after_mutation(&patches);

            let added = match model.tree.store_mut().end_capture() {
                Ok(Some(meta)) => {
                    let before = self.versions_before.get(id).copied().unwrap_or(1);
                    model.history.stamp(meta, before);
                    true
                }
                Ok(None) => false,
                Err(err) => {
                    first_error.get_or_insert(EditorError::from(err));
                    false
                }
            };

            if let Some(event) = &event {
                self.participants.notify(&ModelChange {
                    scope: model.tree.scope(),
                    event,
                    patches: &patches,
                });
            }

            if added {
                entries.push(EditStackEntry {
                    document: *id,
                    scope: model.tree.scope().clone(),
                    version_before: self.versions_before.get(id).copied().unwrap_or(1),
                    version_after: model.history.alternative_version_id(),
                    cursor_before: cursor_before.clone(),
                    cursor_after: cursor_after.clone(),
                    patches,
                });
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        if entries.is_empty() {
            return Ok(());
        }
        match mode {
            HistoryMode::Tracked => {
                debug!(label, documents = entries.len(), "Committed history entry");
                self.push_history(HistoryEntry {
                    label: label.to_string(),
                    entries,
                });
            }
            HistoryMode::Session => {
                self.clear_redo();
                if let Some(session) = self.session.as_mut() {
                    debug!(session = %session.id, parts = entries.len(), "Added to session");
                    session.parts.extend(entries);
                }
            }
            HistoryMode::Untracked => {}
        }
        Ok(())
    }

    fn clear_redo(&mut self) {
        self.redo_stack.clear();
        for model in self.documents.values_mut() {
            model.tree.store_mut().clear_redo();
        }
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        self.undo_stack.push(entry);
        self.clear_redo();

        let max = self.config.max_undo_levels;
        if max > 0 && self.undo_stack.len() > max {
            let dropped = self.undo_stack.remove(0);
            for stale in &dropped.entries {
                // Items of an open session sit above every history entry
                let pending = self
                    .session
                    .as_ref()
                    .map_or(0, |session| {
                        session.parts.iter().filter(|p| p.document == stale.document).count()
                    });
                let keep = self
                    .undo_stack
                    .iter()
                    .map(|entry| entry.parts_in(stale.document))
                    .sum::<usize>()
                    + pending;
                if let Some(model) = self.documents.get_mut(&stale.document) {
                    model.tree.store_mut().truncate_undo(keep);
                }
            }
            debug!(label = %dropped.label, "Dropped oldest history entry");
        }
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Open a gesture session. Forking while a session is open joins it.
    pub fn fork(
        &mut self,
        label: &str,
        cursor_before: Vec<ScopedIdentifier>,
    ) -> Result<SessionId, EditorError> {
        if self.is_updating() {
            return Err(EditorError::InTransaction("fork"));
        }
        if let Some(session) = &self.session {
            debug!(session = %session.id, "Joined open session");
            return Ok(session.id);
        }
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.session = Some(Session {
            id,
            label: label.to_string(),
            cursor_before,
            parts: Vec::new(),
        });
        info!(session = %id, label, "Forked session");
        Ok(id)
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    fn open_session(&self, id: SessionId) -> Result<&Session, EditorError> {
        self.session
            .as_ref()
            .filter(|session| session.id == id)
            .ok_or_else(|| EditorError::SessionNotOpen(id.to_string()))
    }

    /// Run `f` as one step of session `id`. Its changes join the session's
    /// single history entry instead of becoming their own.
    pub fn add<R>(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        if self.is_updating() {
            return Err(EditorError::InTransaction("add"));
        }
        let session = self.open_session(id)?;
        let (label, cursor_before) = (session.label.clone(), session.cursor_before.clone());
        self.run(&label, HistoryMode::Session, cursor_before, f, |_| Vec::new())
    }

    /// Close session `id` as one history entry. Returns false when `id` is not
    /// the open session or nothing was added.
    pub fn commit_and_merge(
        &mut self,
        id: SessionId,
        cursor_after: Vec<ScopedIdentifier>,
    ) -> Result<bool, EditorError> {
        if self.is_updating() {
            return Err(EditorError::InTransaction("commit_and_merge"));
        }
        match self.session.take() {
            Some(mut session) if session.id == id => {
                for part in session.parts.iter_mut() {
                    part.cursor_after = cursor_after.clone();
                }
                Ok(self.close_session(session))
            }
            other => {
                self.session = other;
                debug!(session = %id, "Commit for a session that is not open");
                Ok(false)
            }
        }
    }

    /// Revert every step of session `id` and drop it
    pub fn checkout(&mut self, id: SessionId) -> Result<bool, EditorError> {
        if self.is_updating() {
            return Err(EditorError::InTransaction("checkout"));
        }
        let session = match self.session.take() {
            Some(session) if session.id == id => session,
            other => {
                self.session = other;
                return Ok(false);
            }
        };
        if session.parts.is_empty() {
            info!(session = %id, "Checked out empty session");
            return Ok(true);
        }

        let entry = HistoryEntry {
            label: session.label.clone(),
            entries: session.parts.clone(),
        };
        if let Err(err) = self.step_entry(&entry, Step::Undo) {
            self.session = Some(session);
            return Err(err);
        }
        self.clear_redo();
        info!(session = %id, label = %entry.label, "Checked out session");
        Ok(true)
    }

    fn close_session(&mut self, session: Session) -> bool {
        if session.parts.is_empty() {
            debug!(session = %session.id, "Closed empty session");
            return false;
        }
        info!(session = %session.id, parts = session.parts.len(), "Committed session");
        self.push_history(HistoryEntry {
            label: session.label,
            entries: session.parts,
        });
        true
    }

    fn commit_open_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.close_session(session);
        }
    }

    /// Recover after a panic unwound through a transaction
    pub fn reset(&mut self) {
        if self.depth == 0 && !self.recorder.is_recording() {
            return;
        }
        warn!(depth = self.depth, "Resetting interrupted transaction");
        self.depth = 0;
        self.recorder = PatchRecorder::new();
        for model in self.documents.values_mut() {
            if model.tree.store().is_capturing() {
                if let Err(err) = model.tree.store_mut().rollback_capture() {
                    error!(scope = %model.tree.scope(), error = %err, "Rollback during reset failed");
                }
            }
            model.history.reset();
        }
    }

    // ── History ──────────────────────────────────────────────────

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn undo_label(&self) -> Option<&str> {
        self.undo_stack.last().map(|entry| entry.label.as_str())
    }

    pub fn redo_label(&self) -> Option<&str> {
        self.redo_stack.last().map(|entry| entry.label.as_str())
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.undo_stack
    }

    pub fn clear_history(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        if let Some(session) = self.session.as_mut() {
            session.parts.clear();
        }
        for model in self.documents.values_mut() {
            model.tree.store_mut().clear_history();
        }
    }

    /// Undo the newest history entry across every document it touched
    #[instrument(skip(self))]
    pub fn undo(&mut self) -> Result<bool, EditorError> {
        self.commit_open_session();
        let Some(entry) = self.undo_stack.pop() else {
            warn!("Nothing to undo");
            return Ok(false);
        };
        if let Err(err) = self.step_entry(&entry, Step::Undo) {
            self.undo_stack.push(entry);
            return Err(err);
        }

        info!(label = %entry.label, "Undo");
        self.redo_stack.push(entry);
        Ok(true)
    }

    /// Redo the newest undone history entry
    #[instrument(skip(self))]
    pub fn redo(&mut self) -> Result<bool, EditorError> {
        self.commit_open_session();
        let Some(entry) = self.redo_stack.pop() else {
            warn!("Nothing to redo");
            return Ok(false);
        };
        if let Err(err) = self.step_entry(&entry, Step::Redo) {
            self.redo_stack.push(entry);
            return Err(err);
        }

        info!(label = %entry.label, "Redo");
        self.undo_stack.push(entry);
        Ok(true)
    }

    /// Step every part of `entry`: backwards for undo, forwards for redo.
    /// On failure the parts already stepped are stepped back.
    fn step_entry(&mut self, entry: &HistoryEntry, step: Step) -> Result<(), EditorError> {
        let order: Vec<usize> = match step {
            Step::Undo => (0..entry.entries.len()).rev().collect(),
            Step::Redo => (0..entry.entries.len()).collect(),
        };
        let mut done = Vec::new();
        for index in order {
            let part = &entry.entries[index];
            if let Err(err) = self.step_document(part, step) {
                error!(label = %entry.label, scope = %part.scope, error = %err, "History step failed");
                for index in done.into_iter().rev() {
                    let part: &EditStackEntry = &entry.entries[index];
                    if let Err(restore) = self.step_document(part, step.reverse()) {
                        error!(scope = %part.scope, error = %restore, "Could not restore document");
                    }
                }
                return Err(err);
            }
            done.push(index);
        }
        Ok(())
    }

    fn step_document(&mut self, part: &EditStackEntry, step: Step) -> Result<(), EditorError> {
        let Some(model) = self.documents.get_mut(&part.document) else {
            warn!(scope = %part.scope, "Skipping destroyed document");
            return Ok(());
        };
        let event = match step {
            Step::Undo => model
                .history
                .undo(model.tree.store_mut(), Some(part.cursor_before.clone()))?,
            Step::Redo => model
                .history
                .redo(model.tree.store_mut(), Some(part.cursor_after.clone()))?,
        };
        if let Err(err) = model.tree.sweep_orphans() {
            error!(scope = %part.scope, error = %err, "Orphan sweep failed");
        }
        notify_popped(&mut self.participants, model, event);
        Ok(())
    }
}

fn notify_popped(
    participants: &mut ParticipantRegistry,
    model: &DocumentModel,
    event: Option<ContentChangedEvent>,
) {
    if let Some(event) = event {
        participants.notify(&ModelChange {
            scope: model.tree.scope(),
            event: &event,
            patches: &[],
        });
    }
}

impl fmt::Debug for ModelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelService")
            .field("documents", &self.documents.len())
            .field("depth", &self.depth)
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("session", &self.session())
            .field("participants", &self.participants)
            .finish()
    }
}
