//! # Node Tree
//!
//! Flat `id → node` table of one scope's document, stored under
//! `["nodes"]` in its [`SharedDocumentStore`].
//!
//! ## Design
//!
//! - Reads go through `&NodeTree`. Writes go through [`TreeMut`], which only
//!   a live transaction hands out, so every write is recorded as a patch.
//! - Parent/child links are the `parent` field plus a fractional `order`
//!   key among siblings. Moving a node rewrites two fields, nothing else.
//! - Navigation scans the table: O(n) per call.
//!
//! ## Placement
//!
//! ```text
//! AsLastChild(ref)  → between(last child of ref, ∅)      "0.5" when empty
//! Before(ref)       → between(previous sibling, ref)
//! After(ref)        → between(ref, next sibling)
//! ```
//!
//! Keys that grow past `max_order_digits` fractional digits trigger a
//! rebalance of the parent's children with short, evenly spread keys.

use crate::config::EditorConfig;
use crate::errors::EditorError;
use crate::node::{
    Node, NodeInit, NodeKind, FIELD_CONTENT, FIELD_ORDER, FIELD_PARENT, FIELD_STYLE, NODES_KEY,
    ROOT_NODE_ID,
};
use crate::store::{SharedDocumentStore, StoreValue};
use crate::tracker::{DocumentId, Handle, HandleArena, PatchError, PatchRecorder, Tracker};
use canvas_common::{order, CommonError, Scope};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use tracing::{debug, warn};

/// Where [`TreeMut::insert`] puts the new node relative to the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    AsLastChild,
    Before,
    After,
}

/// What [`TreeMut::remove`] deletes relative to the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveScope {
    SelfAndDescendants,
    ChildrenOnly,
    PrecedingSibling,
    FollowingSibling,
}

/// Target position among a parent's children
#[derive(Debug, Clone, Copy)]
enum Slot<'s> {
    End,
    Before(&'s str),
    After(&'s str),
}

pub struct NodeTree {
    scope: Scope,
    document: DocumentId,
    store: Box<dyn SharedDocumentStore>,
    arena: HandleArena,
    next_seq: u64,
}

fn nodes_path() -> Vec<String> {
    vec![NODES_KEY.to_string()]
}

fn node_path(id: &str) -> Vec<String> {
    vec![NODES_KEY.to_string(), id.to_string()]
}

/// Children of `parent` in sibling order (ties broken by id)
fn sorted_children(all: &[Node], parent: &str) -> Vec<Node> {
    let mut children: Vec<Node> = all
        .iter()
        .filter(|n| n.parent.as_deref() == Some(parent))
        .cloned()
        .collect();
    children.sort_by(|a, b| {
        order::compare(
            a.order.as_deref().unwrap_or_default(),
            b.order.as_deref().unwrap_or_default(),
        )
        .then_with(|| a.id.cmp(&b.id))
    });
    children
}

fn sibling_of(all: &[Node], node: &Node, offset: isize) -> Option<Node> {
    let parent = node.parent.as_deref()?;
    let siblings = sorted_children(all, parent);
    let index = siblings.iter().position(|n| n.id == node.id)?;
    let target = index.checked_add_signed(offset)?;
    siblings.get(target).cloned()
}

/// Post-order walk: descendants of `id` first, then `id`
fn collect_subtree(all: &[Node], id: &str, out: &mut Vec<String>) {
    for child in sorted_children(all, id) {
        collect_subtree(all, &child.id, out);
    }
    out.push(id.to_string());
}

fn order_of(node: &Node) -> Result<&str, EditorError> {
    node.order
        .as_deref()
        .ok_or_else(|| EditorError::Corrupt(format!("node {} has no order", node.id)))
}

fn validate_nodes(nodes: &[Node]) -> Result<(), EditorError> {
    let mut by_id: HashMap<&str, &Node> = HashMap::new();
    for node in nodes {
        if by_id.insert(node.id.as_str(), node).is_some() {
            return Err(EditorError::InvalidStructure(format!(
                "duplicate node id {}",
                node.id
            )));
        }
    }

    let root_count = nodes.iter().filter(|n| n.is_root()).count();
    match by_id.get(ROOT_NODE_ID) {
        Some(root) if root.is_root() && root_count == 1 => {
            if root.parent.is_some() || root.order.is_some() {
                return Err(EditorError::InvalidStructure(
                    "root node has a parent or order".to_string(),
                ));
            }
        }
        _ => {
            return Err(EditorError::InvalidStructure(format!(
                "expected exactly one root node with id {}",
                ROOT_NODE_ID
            )))
        }
    }

    for node in nodes.iter().filter(|n| !n.is_root()) {
        let parent = node
            .parent
            .as_deref()
            .and_then(|p| by_id.get(p))
            .ok_or_else(|| {
                EditorError::InvalidStructure(format!("node {} has no valid parent", node.id))
            })?;
        if parent.is_text() {
            return Err(EditorError::InvalidStructure(format!(
                "text node {} cannot have children",
                parent.id
            )));
        }
        if !node.order.as_deref().is_some_and(order::is_valid) {
            return Err(EditorError::InvalidStructure(format!(
                "node {} has no valid order",
                node.id
            )));
        }

        // every chain must reach the root within n steps
        let mut cursor = *parent;
        let mut steps = 0;
        while !cursor.is_root() {
            steps += 1;
            if steps > nodes.len() {
                return Err(EditorError::CycleDetected);
            }
            cursor = cursor
                .parent
                .as_deref()
                .and_then(|p| by_id.get(p))
                .copied()
                .ok_or_else(|| {
                    EditorError::InvalidStructure(format!("node {} is detached", node.id))
                })?;
        }
    }
    Ok(())
}

impl NodeTree {
    /// Open the tree stored in `store`, seeding a lone root when it is empty
    pub(crate) fn new(
        scope: Scope,
        document: DocumentId,
        mut store: Box<dyn SharedDocumentStore>,
    ) -> Result<Self, EditorError> {
        match store.get(&nodes_path()) {
            None => {
                let nodes: StoreValue =
                    std::iter::once((ROOT_NODE_ID, Node::root().to_value()?)).collect();
                store.set(&nodes_path(), nodes)?;
            }
            Some(value) if value.is_map() => {}
            Some(_) => {
                return Err(EditorError::Corrupt(format!(
                    "{} of scope {} is not a map",
                    NODES_KEY, scope
                )))
            }
        }

        let tree = Self {
            scope,
            document,
            store,
            arena: HandleArena::new(),
            next_seq: 0,
        };
        validate_nodes(&tree.nodes()?)?;
        Ok(tree)
    }

    /// Open a tree seeded with `nodes`. The seed bypasses history.
    pub(crate) fn with_nodes(
        scope: Scope,
        document: DocumentId,
        mut store: Box<dyn SharedDocumentStore>,
        nodes: Vec<Node>,
    ) -> Result<Self, EditorError> {
        validate_nodes(&nodes)?;
        let table = nodes
            .iter()
            .map(|node| node.to_value().map(|value| (node.id.as_str(), value)))
            .collect::<Result<StoreValue, EditorError>>()?;
        store.set(&nodes_path(), table)?;
        Self::new(scope, document, store)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn document(&self) -> DocumentId {
        self.document
    }

    pub fn store(&self) -> &dyn SharedDocumentStore {
        self.store.as_ref()
    }

    pub(crate) fn store_mut(&mut self) -> &mut dyn SharedDocumentStore {
        self.store.as_mut()
    }

    /// Every node, decoded
    pub fn nodes(&self) -> Result<Vec<Node>, EditorError> {
        match self.store.get(&nodes_path()) {
            Some(StoreValue::Map(table)) => table.values().map(Node::from_value).collect(),
            _ => Err(EditorError::Corrupt(format!(
                "scope {} has no node table",
                self.scope
            ))),
        }
    }

    /// Node `id`, or [`EditorError::NodeNotFound`]
    pub fn node(&self, id: &str) -> Result<Node, EditorError> {
        let value = self
            .store
            .get(&node_path(id))
            .ok_or_else(|| EditorError::NodeNotFound(id.to_string()))?;
        Node::from_value(&value)
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.node(id).ok()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.store.get(&node_path(id)).is_some()
    }

    pub fn root(&self) -> Result<Node, EditorError> {
        self.node(ROOT_NODE_ID)
    }

    pub fn len(&self) -> usize {
        self.store.keys(&nodes_path()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Children of `id` in sibling order
    pub fn children_of(&self, id: &str) -> Result<Vec<Node>, EditorError> {
        self.node(id)?;
        Ok(sorted_children(&self.nodes()?, id))
    }

    pub fn parent_of(&self, id: &str) -> Result<Option<Node>, EditorError> {
        match self.node(id)?.parent {
            Some(parent) => self.node(&parent).map(Some),
            None => Ok(None),
        }
    }

    pub fn previous_sibling_of(&self, id: &str) -> Result<Option<Node>, EditorError> {
        let node = self.node(id)?;
        Ok(sibling_of(&self.nodes()?, &node, -1))
    }

    pub fn next_sibling_of(&self, id: &str) -> Result<Option<Node>, EditorError> {
        let node = self.node(id)?;
        Ok(sibling_of(&self.nodes()?, &node, 1))
    }

    /// Ancestors of `id`, root first
    pub fn ancestors_of(&self, id: &str) -> Result<Vec<Node>, EditorError> {
        let mut chain = Vec::new();
        let mut cursor = self.node(id)?;
        let limit = self.len();
        while let Some(parent) = cursor.parent.clone() {
            if chain.len() > limit {
                return Err(EditorError::CycleDetected);
            }
            cursor = self.node(&parent)?;
            chain.push(cursor.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    /// Whether `ancestor` is a strict ancestor of `id`
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> Result<bool, EditorError> {
        Ok(self.ancestors_of(id)?.iter().any(|n| n.id == ancestor))
    }

    pub fn query(&self, predicate: impl Fn(&Node) -> bool) -> Result<Vec<Node>, EditorError> {
        let mut matches: Vec<Node> = self.nodes()?.into_iter().filter(|n| predicate(n)).collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    /// Deep copy of the whole document
    pub fn snapshot(&self) -> StoreValue {
        self.store.snapshot()
    }

    /// Delete every subtree whose parent no longer exists, outside of
    /// history. Returns the removed ids.
    ///
    /// Undo can remove a parent that gained children through untracked writes.
    pub(crate) fn sweep_orphans(&mut self) -> Result<Vec<String>, EditorError> {
        let all = self.nodes()?;
        let ids: HashSet<&str> = all.iter().map(|n| n.id.as_str()).collect();
        let mut orphans = Vec::new();
        for node in &all {
            match node.parent.as_deref() {
                Some(parent) if !ids.contains(parent) => {
                    collect_subtree(&all, &node.id, &mut orphans)
                }
                _ => {}
            }
        }
        if orphans.is_empty() {
            return Ok(orphans);
        }

        self.store.begin_capture(false)?;
        for id in &orphans {
            if let Err(err) = self.store.delete(&node_path(id)) {
                self.store.rollback_capture()?;
                return Err(err.into());
            }
        }
        self.store.end_capture()?;
        warn!(scope = %self.scope, count = orphans.len(), "Removed orphaned nodes");
        Ok(orphans)
    }
}

impl fmt::Debug for NodeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTree")
            .field("scope", &self.scope)
            .field("document", &self.document)
            .field("nodes", &self.len())
            .finish()
    }
}

fn nodes_handle(tracker: &mut Tracker<'_, dyn SharedDocumentStore>) -> Result<Handle, PatchError> {
    let root = tracker.root();
    tracker.child(root, NODES_KEY)
}

fn node_handle(
    tracker: &mut Tracker<'_, dyn SharedDocumentStore>,
    id: &str,
) -> Result<Handle, PatchError> {
    let nodes = nodes_handle(tracker)?;
    tracker.child(nodes, id)
}

/// Mutable view of a [`NodeTree`] inside a transaction
pub struct TreeMut<'a> {
    tree: &'a mut NodeTree,
    recorder: &'a mut PatchRecorder,
    config: &'a EditorConfig,
}

impl Deref for TreeMut<'_> {
    type Target = NodeTree;

    fn deref(&self) -> &NodeTree {
        self.tree
    }
}

impl<'a> TreeMut<'a> {
    pub(crate) fn new(
        tree: &'a mut NodeTree,
        recorder: &'a mut PatchRecorder,
        config: &'a EditorConfig,
    ) -> Self {
        Self {
            tree,
            recorder,
            config,
        }
    }

    fn tracker(&mut self) -> Tracker<'_, dyn SharedDocumentStore> {
        assert!(
            self.recorder.is_recording(),
            "node tree of scope {} mutated outside of a transaction",
            self.tree.scope
        );
        Tracker::new(
            self.tree.store.as_mut(),
            &mut self.tree.arena,
            &mut *self.recorder,
            self.tree.document,
        )
    }

    fn next_id(&mut self) -> String {
        loop {
            self.tree.next_seq += 1;
            let id = format!(
                "{}:{}:{}",
                self.config.client_id, self.tree.scope, self.tree.next_seq
            );
            if !self.tree.contains(&id) {
                return id;
            }
        }
    }

    fn write_fields(
        &mut self,
        id: &str,
        fields: &[(&str, Option<StoreValue>)],
    ) -> Result<(), EditorError> {
        let mut tracker = self.tracker();
        let node = node_handle(&mut tracker, id)?;
        for (field, value) in fields {
            match value {
                Some(value) => tracker.set(node, field, value.clone())?,
                None => tracker.delete(node, field)?,
            };
        }
        Ok(())
    }

    fn delete_nodes(&mut self, ids: &[String]) -> Result<(), EditorError> {
        let mut tracker = self.tracker();
        let nodes = nodes_handle(&mut tracker)?;
        for id in ids {
            tracker.delete(nodes, id)?;
        }
        Ok(())
    }

    fn neighbours(
        &self,
        parent: &str,
        slot: Slot<'_>,
        exclude: Option<&str>,
    ) -> Result<(Option<String>, Option<String>), EditorError> {
        let siblings: Vec<Node> = sorted_children(&self.tree.nodes()?, parent)
            .into_iter()
            .filter(|n| Some(n.id.as_str()) != exclude)
            .collect();

        let position = |anchor: &str| {
            siblings
                .iter()
                .position(|n| n.id == anchor)
                .ok_or_else(|| EditorError::NotASibling {
                    node: anchor.to_string(),
                    parent: parent.to_string(),
                })
        };
        let key_at = |index: usize| -> Result<Option<String>, EditorError> {
            siblings
                .get(index)
                .map(|n| order_of(n).map(str::to_string))
                .transpose()
        };

        match slot {
            Slot::End => {
                let lower = match siblings.len().checked_sub(1) {
                    Some(last) => key_at(last)?,
                    None => None,
                };
                Ok((lower, None))
            }
            Slot::Before(anchor) => {
                let index = position(anchor)?;
                let lower = match index.checked_sub(1) {
                    Some(prev) => key_at(prev)?,
                    None => None,
                };
                Ok((lower, key_at(index)?))
            }
            Slot::After(anchor) => {
                let index = position(anchor)?;
                Ok((key_at(index)?, key_at(index + 1)?))
            }
        }
    }

    /// Fresh order key for `slot` among `parent`'s children
    fn key_for(
        &mut self,
        parent: &str,
        slot: Slot<'_>,
        exclude: Option<&str>,
    ) -> Result<String, EditorError> {
        let (lower, upper) = self.neighbours(parent, slot, exclude)?;
        match order::between(lower.as_deref(), upper.as_deref()) {
            Ok(key) => Ok(key),
            Err(CommonError::NotAscending { .. }) => {
                // siblings share a key; spread them out and retry once
                warn!(scope = %self.tree.scope, parent, "Colliding sibling order keys");
                self.rebalance(parent)?;
                let (lower, upper) = self.neighbours(parent, slot, exclude)?;
                Ok(order::between(lower.as_deref(), upper.as_deref())?)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn check_growth(&mut self, parent: &str, key: &str) -> Result<(), EditorError> {
        let digits = order::fraction_digits(key).unwrap_or_default();
        if digits > self.config.max_order_digits {
            warn!(
                scope = %self.tree.scope,
                parent,
                digits,
                "Order key too long, rebalancing siblings"
            );
            self.rebalance(parent)?;
        }
        Ok(())
    }

    fn require_container(&self, id: &str) -> Result<Node, EditorError> {
        let node = self.tree.node(id)?;
        if node.is_text() {
            return Err(EditorError::InvalidStructure(format!(
                "text node {} cannot have children",
                id
            )));
        }
        Ok(node)
    }

    /// Insert a node relative to `reference` and return its id
    pub fn insert(
        &mut self,
        reference: &str,
        placement: Placement,
        init: NodeInit,
    ) -> Result<String, EditorError> {
        match init.kind {
            NodeKind::Root => {
                return Err(EditorError::InvalidStructure(
                    "a document has exactly one root".to_string(),
                ))
            }
            NodeKind::Text => {}
            _ if init.content.is_some() => {
                return Err(EditorError::InvalidStructure(
                    "only text nodes carry content".to_string(),
                ))
            }
            _ => {}
        }

        let reference_node = self.tree.node(reference)?;
        let (parent, key) = match placement {
            Placement::AsLastChild => {
                self.require_container(reference)?;
                let key = self.key_for(reference, Slot::End, None)?;
                (reference.to_string(), key)
            }
            Placement::Before | Placement::After => {
                let parent = reference_node.parent.clone().ok_or_else(|| {
                    EditorError::InvalidPlacement(format!(
                        "{} has no parent to insert next to",
                        reference
                    ))
                })?;
                let slot = if placement == Placement::Before {
                    Slot::Before(reference)
                } else {
                    Slot::After(reference)
                };
                let key = self.key_for(&parent, slot, None)?;
                (parent, key)
            }
        };

        let id = self.next_id();
        let node = Node {
            id: id.clone(),
            kind: init.kind,
            parent: Some(parent.clone()),
            order: Some(key.clone()),
            style: init.style,
            content: match init.kind {
                NodeKind::Text => Some(init.content.unwrap_or_default()),
                _ => None,
            },
        };

        let mut tracker = self.tracker();
        let nodes = nodes_handle(&mut tracker)?;
        tracker.set(nodes, &id, node.to_value()?)?;

        debug!(scope = %self.tree.scope, id = %id, parent = %parent, order = %key, "Inserted node");
        self.check_growth(&parent, &key)?;
        Ok(id)
    }

    /// Remove nodes relative to `reference`. Returns the removed ids,
    /// descendants before their ancestors.
    pub fn remove(
        &mut self,
        reference: &str,
        scope: RemoveScope,
    ) -> Result<Vec<String>, EditorError> {
        let node = self.tree.node(reference)?;
        let all = self.tree.nodes()?;

        let targets = match scope {
            RemoveScope::SelfAndDescendants => {
                if node.is_root() {
                    return Err(EditorError::RootImmutable);
                }
                vec![node.id.clone()]
            }
            RemoveScope::ChildrenOnly => sorted_children(&all, reference)
                .into_iter()
                .map(|n| n.id)
                .collect(),
            RemoveScope::PrecedingSibling | RemoveScope::FollowingSibling => {
                let (offset, direction) = if scope == RemoveScope::PrecedingSibling {
                    (-1, "preceding")
                } else {
                    (1, "following")
                };
                let sibling =
                    sibling_of(&all, &node, offset).ok_or_else(|| EditorError::NoSibling {
                        id: reference.to_string(),
                        direction,
                    })?;
                vec![sibling.id]
            }
        };

        let mut removed = Vec::new();
        for target in &targets {
            collect_subtree(&all, target, &mut removed);
        }
        self.delete_nodes(&removed)?;

        debug!(scope = %self.tree.scope, reference, count = removed.len(), "Removed nodes");
        Ok(removed)
    }

    /// Remove several nodes with their subtrees. Ids covered by an earlier
    /// subtree are skipped.
    pub fn remove_nodes(&mut self, ids: &[&str]) -> Result<Vec<String>, EditorError> {
        let all = self.tree.nodes()?;
        for id in ids {
            let node = all
                .iter()
                .find(|n| n.id == *id)
                .ok_or_else(|| EditorError::NodeNotFound(id.to_string()))?;
            if node.is_root() {
                return Err(EditorError::RootImmutable);
            }
        }

        let mut removed = Vec::new();
        let mut seen = HashSet::new();
        for id in ids {
            if seen.contains(*id) {
                continue;
            }
            let mut subtree = Vec::new();
            collect_subtree(&all, id, &mut subtree);
            for removed_id in subtree {
                if seen.insert(removed_id.clone()) {
                    removed.push(removed_id);
                }
            }
        }
        self.delete_nodes(&removed)?;
        Ok(removed)
    }

    /// Remove every text node whose content is empty
    pub fn remove_empty_text_nodes(&mut self) -> Result<Vec<String>, EditorError> {
        let empty: Vec<String> = self
            .tree
            .query(|n| n.is_text() && n.content.as_deref().map_or(true, str::is_empty))?
            .into_iter()
            .map(|n| n.id)
            .collect();
        if empty.is_empty() {
            return Ok(empty);
        }
        let ids: Vec<&str> = empty.iter().map(String::as_str).collect();
        self.remove_nodes(&ids)
    }

    /// Move `id` under `new_parent`, before `before` or last
    pub fn reparent(
        &mut self,
        id: &str,
        new_parent: &str,
        before: Option<&str>,
    ) -> Result<(), EditorError> {
        let node = self.tree.node(id)?;
        if node.is_root() {
            return Err(EditorError::RootImmutable);
        }
        self.require_container(new_parent)?;
        if id == new_parent || self.tree.is_ancestor(id, new_parent)? {
            return Err(EditorError::CycleDetected);
        }

        let slot = before.map_or(Slot::End, Slot::Before);
        let key = self.key_for(new_parent, slot, Some(id))?;
        self.write_fields(
            id,
            &[
                (FIELD_PARENT, Some(new_parent.into())),
                (FIELD_ORDER, Some(key.as_str().into())),
            ],
        )?;

        debug!(scope = %self.tree.scope, id, parent = new_parent, order = %key, "Reparented node");
        self.check_growth(new_parent, &key)
    }

    /// Move `id` among its siblings, before `before` or last
    pub fn reorder(&mut self, id: &str, before: Option<&str>) -> Result<(), EditorError> {
        let node = self.tree.node(id)?;
        let parent = node.parent.clone().ok_or(EditorError::RootImmutable)?;
        if before == Some(id) {
            return Ok(());
        }

        let slot = before.map_or(Slot::End, Slot::Before);
        let key = self.key_for(&parent, slot, Some(id))?;
        self.write_fields(id, &[(FIELD_ORDER, Some(key.as_str().into()))])?;
        debug_assert_eq!(
            self.tree.get(id).and_then(|n| n.parent).as_deref(),
            Some(parent.as_str())
        );

        debug!(scope = %self.tree.scope, id, order = %key, "Reordered node");
        self.check_growth(&parent, &key)
    }

    /// Set (`Some`) or delete (`None`) one style property
    pub fn update_style(
        &mut self,
        id: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), EditorError> {
        self.tree.node(id)?;
        let mut tracker = self.tracker();
        let node = node_handle(&mut tracker, id)?;
        let style = match tracker.child(node, FIELD_STYLE) {
            Ok(style) => style,
            Err(PatchError::NotAMap(_)) => {
                tracker.set(node, FIELD_STYLE, StoreValue::map())?;
                tracker.child(node, FIELD_STYLE)?
            }
            Err(err) => return Err(err.into()),
        };
        match value {
            Some(value) => tracker.set(style, key, value.into())?,
            None => tracker.delete(style, key)?,
        };
        Ok(())
    }

    /// Replace the content of a text node
    pub fn set_content(&mut self, id: &str, content: &str) -> Result<(), EditorError> {
        if !self.tree.node(id)?.is_text() {
            return Err(EditorError::NotText(id.to_string()));
        }
        self.write_fields(id, &[(FIELD_CONTENT, Some(content.into()))])
    }

    /// Re-key every child of `parent` with short, evenly spread keys,
    /// keeping their current order
    pub fn rebalance(&mut self, parent: &str) -> Result<(), EditorError> {
        let children = self.tree.children_of(parent)?;
        let keys = order::spread(children.len());

        let mut tracker = self.tracker();
        let nodes = nodes_handle(&mut tracker)?;
        let mut rewritten = 0;
        for (child, key) in children.iter().zip(keys) {
            if child.order.as_deref() == Some(key.as_str()) {
                continue;
            }
            let handle = tracker.child(nodes, &child.id)?;
            tracker.set(handle, FIELD_ORDER, key.into())?;
            rewritten += 1;
        }

        debug!(scope = %self.tree.scope, parent, rewritten, "Rebalanced children");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use canvas_common::ScopeRegistry;

    struct Fixture {
        tree: NodeTree,
        recorder: PatchRecorder,
        config: EditorConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = ScopeRegistry::new();
            let tree = NodeTree::new(
                registry.root(),
                DocumentId(0),
                Box::new(MemoryStore::new()),
            )
            .unwrap();
            let mut recorder = PatchRecorder::new();
            recorder.open();
            Self {
                tree,
                recorder,
                config: EditorConfig::default(),
            }
        }

        fn edit(&mut self) -> TreeMut<'_> {
            TreeMut::new(&mut self.tree, &mut self.recorder, &self.config)
        }

        fn orders(&self, parent: &str) -> Vec<String> {
            self.tree
                .children_of(parent)
                .unwrap()
                .into_iter()
                .map(|n| n.order.unwrap())
                .collect()
        }

        fn ids(&self, parent: &str) -> Vec<String> {
            self.tree
                .children_of(parent)
                .unwrap()
                .into_iter()
                .map(|n| n.id)
                .collect()
        }
    }

    #[test]
    fn test_new_tree_has_root_only() {
        let fx = Fixture::new();
        assert_eq!(fx.tree.len(), 1);
        let root = fx.tree.root().unwrap();
        assert_eq!(root.id, ROOT_NODE_ID);
        assert!(root.parent.is_none() && root.order.is_none());
    }

    #[test]
    fn test_insert_order_keys() {
        let mut fx = Fixture::new();
        let a = fx.edit().insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        assert_eq!(fx.tree.node(&a).unwrap().order.as_deref(), Some("0.5"));

        let b = fx.edit().insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        assert_eq!(fx.tree.node(&b).unwrap().order.as_deref(), Some("0.75"));

        let c = fx.edit().insert(&b, Placement::Before, NodeInit::block()).unwrap();
        assert_eq!(fx.tree.node(&c).unwrap().order.as_deref(), Some("0.625"));

        let d = fx.edit().insert(&a, Placement::Before, NodeInit::block()).unwrap();
        assert_eq!(fx.tree.node(&d).unwrap().order.as_deref(), Some("0.25"));

        let e = fx.edit().insert(&b, Placement::After, NodeInit::block()).unwrap();
        assert_eq!(fx.tree.node(&e).unwrap().order.as_deref(), Some("0.875"));

        assert_eq!(fx.ids(ROOT_NODE_ID), vec![d, a, c, b, e]);
    }

    #[test]
    fn test_insert_ids_are_client_scoped() {
        let mut fx = Fixture::new();
        let id = fx.edit().insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        assert_eq!(id, "local:/:1");
    }

    #[test]
    fn test_insert_rejects_bad_input() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.edit().insert("missing", Placement::AsLastChild, NodeInit::block()),
            Err(EditorError::NodeNotFound(_))
        ));
        assert!(matches!(
            fx.edit().insert(ROOT_NODE_ID, Placement::Before, NodeInit::block()),
            Err(EditorError::InvalidPlacement(_))
        ));

        let text = fx.edit().insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::text("hi")).unwrap();
        assert!(matches!(
            fx.edit().insert(&text, Placement::AsLastChild, NodeInit::block()),
            Err(EditorError::InvalidStructure(_))
        ));
        let mut bad = NodeInit::block();
        bad.content = Some("x".to_string());
        assert!(matches!(
            fx.edit().insert(ROOT_NODE_ID, Placement::AsLastChild, bad),
            Err(EditorError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_remove_cascades_depth_first() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let a = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let a1 = edit.insert(&a, Placement::AsLastChild, NodeInit::block()).unwrap();
        let a1x = edit.insert(&a1, Placement::AsLastChild, NodeInit::text("x")).unwrap();
        let b = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();

        let removed = edit.remove(&a, RemoveScope::SelfAndDescendants).unwrap();
        assert_eq!(removed, vec![a1x, a1, a]);
        assert_eq!(fx.ids(ROOT_NODE_ID), vec![b]);
    }

    #[test]
    fn test_remove_siblings_and_children() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let a = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let b = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let c = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();

        assert!(matches!(
            edit.remove(&a, RemoveScope::PrecedingSibling),
            Err(EditorError::NoSibling { .. })
        ));
        assert_eq!(edit.remove(&b, RemoveScope::FollowingSibling).unwrap(), vec![c]);
        assert_eq!(edit.remove(&b, RemoveScope::PrecedingSibling).unwrap(), vec![a]);
        assert!(matches!(
            edit.remove(ROOT_NODE_ID, RemoveScope::SelfAndDescendants),
            Err(EditorError::RootImmutable)
        ));

        edit.remove(ROOT_NODE_ID, RemoveScope::ChildrenOnly).unwrap();
        assert_eq!(fx.tree.len(), 1);
    }

    #[test]
    fn test_reorder_moves_before_anchor() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let a = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let b = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let c = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();

        edit.reorder(&c, Some(&a)).unwrap();
        edit.reorder(&a, None).unwrap();
        assert_eq!(fx.ids(ROOT_NODE_ID), vec![c.clone(), b.clone(), a.clone()]);

        // Placing a node before itself leaves it where it is
        let before = fx.tree.node(&b).unwrap().order;
        let mut edit = fx.edit();
        edit.reorder(&b, Some(&b)).unwrap();
        assert_eq!(fx.ids(ROOT_NODE_ID), vec![c.clone(), b.clone(), a.clone()]);
        assert_eq!(fx.tree.node(&b).unwrap().order, before);

        let mut edit = fx.edit();
        let inner = edit.insert(&b, Placement::AsLastChild, NodeInit::block()).unwrap();
        assert!(matches!(
            edit.reorder(&a, Some(&inner)),
            Err(EditorError::NotASibling { .. })
        ));
        assert!(matches!(
            edit.reorder(ROOT_NODE_ID, None),
            Err(EditorError::RootImmutable)
        ));
    }

    #[test]
    fn test_reparent_and_cycle_detection() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let a = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let b = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let a1 = edit.insert(&a, Placement::AsLastChild, NodeInit::block()).unwrap();

        edit.reparent(&b, &a, Some(&a1)).unwrap();
        assert_eq!(fx.ids(&a), vec![b.clone(), a1.clone()]);
        assert_eq!(fx.tree.parent_of(&b).unwrap().unwrap().id, a);

        let mut edit = fx.edit();
        assert!(matches!(edit.reparent(&a, &a1, None), Err(EditorError::CycleDetected)));
        assert!(matches!(edit.reparent(&a, &a, None), Err(EditorError::CycleDetected)));
        assert!(matches!(
            edit.reparent(ROOT_NODE_ID, &a, None),
            Err(EditorError::RootImmutable)
        ));
    }

    #[test]
    fn test_style_and_content() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let block = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let text = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::text("")).unwrap();

        edit.update_style(&block, "color", Some("red")).unwrap();
        edit.update_style(&block, "width", Some("10px")).unwrap();
        edit.update_style(&block, "width", None).unwrap();
        edit.set_content(&text, "hello").unwrap();
        assert!(matches!(edit.set_content(&block, "x"), Err(EditorError::NotText(_))));

        let node = fx.tree.node(&block).unwrap();
        assert_eq!(node.style.get("color").map(String::as_str), Some("red"));
        assert!(!node.style.contains_key("width"));
        assert_eq!(fx.tree.node(&text).unwrap().content.as_deref(), Some("hello"));
    }

    #[test]
    fn test_remove_empty_text_nodes() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let keep = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::text("x")).unwrap();
        let drop = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::text("")).unwrap();

        assert_eq!(edit.remove_empty_text_nodes().unwrap(), vec![drop]);
        assert_eq!(fx.ids(ROOT_NODE_ID), vec![keep]);
    }

    #[test]
    fn test_remove_nodes_skips_covered_ids() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let a = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let a1 = edit.insert(&a, Placement::AsLastChild, NodeInit::block()).unwrap();

        let removed = edit.remove_nodes(&[a1.as_str(), a.as_str()]).unwrap();
        assert_eq!(removed, vec![a1, a]);
        assert!(matches!(
            edit.remove_nodes(&["nope"]),
            Err(EditorError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_long_keys_trigger_rebalance() {
        let mut fx = Fixture::new();
        fx.config.max_order_digits = 4;
        let mut edit = fx.edit();
        let first = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let mut ids = vec![first.clone()];
        for _ in 0..6 {
            let id = edit.insert(&first, Placement::After, NodeInit::block()).unwrap();
            ids.insert(1, id);
        }

        assert_eq!(fx.ids(ROOT_NODE_ID), ids);
        for key in fx.orders(ROOT_NODE_ID) {
            assert!(order::fraction_digits(&key).unwrap() <= 4, "key {} too long", key);
        }
    }

    #[test]
    fn test_navigation() {
        let mut fx = Fixture::new();
        let mut edit = fx.edit();
        let a = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let b = edit.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block()).unwrap();
        let b1 = edit.insert(&b, Placement::AsLastChild, NodeInit::fragment()).unwrap();

        let tree = &fx.tree;
        assert_eq!(tree.previous_sibling_of(&b).unwrap().unwrap().id, a);
        assert_eq!(tree.next_sibling_of(&a).unwrap().unwrap().id, b);
        assert!(tree.next_sibling_of(&b).unwrap().is_none());
        assert!(tree.parent_of(ROOT_NODE_ID).unwrap().is_none());

        let chain: Vec<String> = tree.ancestors_of(&b1).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(chain, vec![ROOT_NODE_ID.to_string(), b.clone()]);
        assert!(tree.is_ancestor(ROOT_NODE_ID, &b1).unwrap());
        assert!(!tree.is_ancestor(&a, &b1).unwrap());

        let fragments = tree.query(|n| n.kind == NodeKind::Fragment).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(tree.contains(&b1));
        assert!(tree.get("nope").is_none());
    }

    #[test]
    #[should_panic(expected = "outside of a transaction")]
    fn test_write_outside_recording_panics() {
        let mut fx = Fixture::new();
        fx.recorder.close();
        let _ = fx.edit().insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block());
    }

    #[test]
    fn test_seeded_nodes_are_validated() {
        let mut registry = ScopeRegistry::new();
        let orphan = Node {
            id: "x".to_string(),
            kind: NodeKind::Block,
            parent: Some("ghost".to_string()),
            order: Some("0.5".to_string()),
            style: Default::default(),
            content: None,
        };
        let result = NodeTree::with_nodes(
            registry.root(),
            DocumentId(0),
            Box::new(MemoryStore::new()),
            vec![Node::root(), orphan],
        );
        assert!(matches!(result, Err(EditorError::InvalidStructure(_))));

        let missing_root = NodeTree::with_nodes(
            registry.root(),
            DocumentId(0),
            Box::new(MemoryStore::new()),
            vec![],
        );
        assert!(matches!(missing_root, Err(EditorError::InvalidStructure(_))));
    }
}
