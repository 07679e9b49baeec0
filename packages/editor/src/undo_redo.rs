//! # Undo/Redo Stack
//!
//! Per-document version bookkeeping on top of the store's undo manager.
//!
//! ## Design
//!
//! - `version_id` increases on every commit, undo and redo.
//! - `alternative_version_id` names the *content*: undoing back to a state
//!   restores the id that state had, so "is this the saved version?" is a
//!   single comparison.
//! - The store keeps the actual stack. Each stack item carries a
//!   [`StackMeta`] with the alternative ids before and after it; undo/redo
//!   read them back.
//! - Change events fired while a transaction is open are deferred and merged
//!   into one.

use crate::errors::EditorError;
use crate::store::{SharedDocumentStore, StackMeta};
use crate::tracker::Patch;
use canvas_common::ScopedIdentifier;
use tracing::debug;

/// Emitted after a committed change, an undo or a redo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChangedEvent {
    pub version_id: u64,
    pub alternative_version_id: u64,
    pub is_undoing: bool,
    pub is_redoing: bool,
    pub resulting_cursor: Option<Vec<ScopedIdentifier>>,
}

impl ContentChangedEvent {
    /// Fold a later event into this one
    pub fn merge(self, later: ContentChangedEvent) -> ContentChangedEvent {
        ContentChangedEvent {
            version_id: later.version_id,
            alternative_version_id: later.alternative_version_id,
            is_undoing: self.is_undoing || later.is_undoing,
            is_redoing: self.is_redoing || later.is_redoing,
            resulting_cursor: later.resulting_cursor.or(self.resulting_cursor),
        }
    }
}

pub type ContentListener = Box<dyn FnMut(&ContentChangedEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener list with a deferral counter
#[derive(Default)]
pub struct ContentChangedEmitter {
    listeners: Vec<(ListenerId, ContentListener)>,
    next_id: u64,
    deferred: usize,
    pending: Option<ContentChangedEvent>,
}

impl ContentChangedEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: ContentListener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred > 0
    }

    pub fn begin_deferred(&mut self) {
        self.deferred += 1;
    }

    /// Leave one deferral level. The outermost exit emits the merged event,
    /// with `resulting_cursor` applied when given.
    pub fn end_deferred(&mut self, resulting_cursor: Option<Vec<ScopedIdentifier>>) {
        if self.deferred == 0 {
            return;
        }
        self.deferred -= 1;
        if self.deferred > 0 {
            return;
        }
        if let Some(mut event) = self.pending.take() {
            if resulting_cursor.is_some() {
                event.resulting_cursor = resulting_cursor;
            }
            self.emit(&event);
        }
    }

    pub fn fire(&mut self, event: ContentChangedEvent) {
        if self.deferred > 0 {
            self.pending = Some(match self.pending.take() {
                Some(pending) => pending.merge(event),
                None => event,
            });
        } else {
            self.emit(&event);
        }
    }

    /// Drop any deferral state without emitting
    pub fn reset(&mut self) {
        self.deferred = 0;
        self.pending = None;
    }

    fn emit(&mut self, event: &ContentChangedEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }
}

impl std::fmt::Debug for ContentChangedEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentChangedEmitter")
            .field("listeners", &self.listeners.len())
            .field("deferred", &self.deferred)
            .field("pending", &self.pending)
            .finish()
    }
}

#[derive(Debug)]
pub struct UndoRedoStack {
    version_id: u64,
    alternative_version_id: u64,
    emitter: ContentChangedEmitter,
}

impl UndoRedoStack {
    pub fn new() -> Self {
        Self {
            version_id: 1,
            alternative_version_id: 1,
            emitter: ContentChangedEmitter::new(),
        }
    }

    pub fn version_id(&self) -> u64 {
        self.version_id
    }

    pub fn alternative_version_id(&self) -> u64 {
        self.alternative_version_id
    }

    pub fn on_content_changed(&mut self, listener: ContentListener) -> ListenerId {
        self.emitter.subscribe(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.emitter.unsubscribe(id)
    }

    fn increase_version(&mut self) {
        self.version_id += 1;
        self.alternative_version_id = self.version_id;
    }

    fn event(&self, is_undoing: bool, is_redoing: bool) -> ContentChangedEvent {
        ContentChangedEvent {
            version_id: self.version_id,
            alternative_version_id: self.alternative_version_id,
            is_undoing,
            is_redoing,
            resulting_cursor: None,
        }
    }

    /// Called when the outermost transaction opens
    pub fn before_mutation(&mut self) {
        self.emitter.begin_deferred();
    }

    /// Called when the outermost transaction closes with this document's
    /// patches. Bumps the version when there are any and returns the
    /// emitted event.
    pub fn after_mutation(&mut self, patches: &[Patch]) -> Option<ContentChangedEvent> {
        let event = if !patches.is_empty() {
            self.increase_version();
            let event = self.event(false, false);
            self.emitter.fire(event.clone());
            Some(event)
        } else {
            None
        };
        self.emitter.end_deferred(None);
        event
    }

    /// Write the alternative ids around a freshly added stack item
    pub fn stamp(&self, meta: &mut StackMeta, alternative_before: u64) {
        meta.version_before = Some(alternative_before);
        meta.version_after = Some(self.alternative_version_id);
    }

    /// Undo the store's newest item. `None` when there was nothing to undo.
    pub fn undo(
        &mut self,
        store: &mut dyn SharedDocumentStore,
        resulting_cursor: Option<Vec<ScopedIdentifier>>,
    ) -> Result<Option<ContentChangedEvent>, EditorError> {
        let Some(meta) = store.undo()? else {
            return Ok(None);
        };
        self.version_id += 1;
        self.alternative_version_id = meta.version_before.unwrap_or(self.version_id);
        Ok(Some(self.emit_popped(true, false, resulting_cursor)))
    }

    /// Redo the store's newest undone item
    pub fn redo(
        &mut self,
        store: &mut dyn SharedDocumentStore,
        resulting_cursor: Option<Vec<ScopedIdentifier>>,
    ) -> Result<Option<ContentChangedEvent>, EditorError> {
        let Some(meta) = store.redo()? else {
            return Ok(None);
        };
        self.version_id += 1;
        self.alternative_version_id = meta.version_after.unwrap_or(self.version_id);
        Ok(Some(self.emit_popped(false, true, resulting_cursor)))
    }

    fn emit_popped(
        &mut self,
        is_undoing: bool,
        is_redoing: bool,
        resulting_cursor: Option<Vec<ScopedIdentifier>>,
    ) -> ContentChangedEvent {
        let mut event = self.event(is_undoing, is_redoing);
        event.resulting_cursor = resulting_cursor;
        debug!(
            version = self.version_id,
            alternative = self.alternative_version_id,
            is_undoing,
            "Stack item popped"
        );
        self.emitter.fire(event.clone());
        event
    }

    /// Forget deferral state left behind by an aborted transaction
    pub fn reset(&mut self) {
        self.emitter.reset();
    }
}

impl Default for UndoRedoStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::store::{NestedMap, StoreValue};
    use crate::tracker::{DocumentId, PatchOp};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorded(stack: &mut UndoRedoStack) -> Rc<RefCell<Vec<ContentChangedEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        stack.on_content_changed(Box::new(move |event: &ContentChangedEvent| {
            sink.borrow_mut().push(event.clone());
        }));
        events
    }

    fn commit(stack: &mut UndoRedoStack, store: &mut MemoryStore, key: &str) {
        let before = stack.alternative_version_id();
        stack.before_mutation();
        store.begin_capture(true).unwrap();
        store.set(&[key.to_string()], StoreValue::from("x")).unwrap();
        let patch = Patch {
            op: PatchOp::Add,
            path: vec![key.to_string()],
            document: DocumentId(0),
            old_value: None,
            new_value: Some(StoreValue::from("x")),
        };
        stack.after_mutation(&[patch]);
        let meta = store.end_capture().unwrap().unwrap();
        stack.stamp(meta, before);
    }

    #[test]
    fn test_versions_start_at_one() {
        let stack = UndoRedoStack::new();
        assert_eq!(stack.version_id(), 1);
        assert_eq!(stack.alternative_version_id(), 1);
    }

    #[test]
    fn test_undo_redo_restores_alternative_version() {
        let mut stack = UndoRedoStack::new();
        let mut store = MemoryStore::new();
        commit(&mut stack, &mut store, "a");
        commit(&mut stack, &mut store, "b");
        assert_eq!(stack.version_id(), 3);
        assert_eq!(stack.alternative_version_id(), 3);

        stack.undo(&mut store, None).unwrap().unwrap();
        assert_eq!(stack.version_id(), 4);
        assert_eq!(stack.alternative_version_id(), 2);

        stack.undo(&mut store, None).unwrap().unwrap();
        assert_eq!(stack.alternative_version_id(), 1);
        assert!(stack.undo(&mut store, None).unwrap().is_none());

        stack.redo(&mut store, None).unwrap().unwrap();
        assert_eq!(stack.version_id(), 6);
        assert_eq!(stack.alternative_version_id(), 2);
    }

    #[test]
    fn test_events_are_deferred_and_merged() {
        let mut stack = UndoRedoStack::new();
        let events = recorded(&mut stack);

        stack.before_mutation();
        stack.emitter.fire(stack.event(false, false));
        stack.increase_version();
        stack.emitter.fire(stack.event(false, false));
        assert!(events.borrow().is_empty());
        stack.after_mutation(&[]);

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].version_id, 2);
    }

    #[test]
    fn test_unchanged_commit_emits_nothing() {
        let mut stack = UndoRedoStack::new();
        let events = recorded(&mut stack);
        stack.before_mutation();
        assert!(stack.after_mutation(&[]).is_none());
        assert_eq!(stack.version_id(), 1);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_undo_event_flags() {
        let mut stack = UndoRedoStack::new();
        let mut store = MemoryStore::new();
        commit(&mut stack, &mut store, "a");
        let events = recorded(&mut stack);

        stack.undo(&mut store, Some(Vec::new())).unwrap();
        let events = events.borrow();
        assert!(events[0].is_undoing);
        assert!(!events[0].is_redoing);
        assert_eq!(events[0].resulting_cursor, Some(Vec::new()));
    }

    #[test]
    fn test_merge_keeps_latest_versions() {
        let a = ContentChangedEvent {
            version_id: 2,
            alternative_version_id: 2,
            is_undoing: true,
            is_redoing: false,
            resulting_cursor: Some(Vec::new()),
        };
        let b = ContentChangedEvent {
            version_id: 3,
            alternative_version_id: 1,
            is_undoing: false,
            is_redoing: true,
            resulting_cursor: None,
        };
        let merged = a.merge(b);
        assert_eq!(merged.version_id, 3);
        assert_eq!(merged.alternative_version_id, 1);
        assert!(merged.is_undoing && merged.is_redoing);
        assert_eq!(merged.resulting_cursor, Some(Vec::new()));
    }
}
