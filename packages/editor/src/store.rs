//! # Shared Document Store
//!
//! The replicated key/value substrate every document is written into.
//!
//! ## Contract
//!
//! - Values are nested string-keyed maps whose leaves are strings
//!   ([`StoreValue`]). Everything is addressed by a path of keys.
//! - `set` requires every intermediate map to exist; `delete` of a missing
//!   key is a no-op returning `None`.
//! - Deep observers receive one [`StoreEvent`] per closed capture, undo,
//!   redo or rollback, plus one per write made while no capture is open.
//! - The embedded undo manager groups every write between `begin_capture`
//!   and `end_capture` into one stack item. Tracked captures with at least
//!   one change push an item and hand back its mutable [`StackMeta`] slot
//!   (the "stack item added" event). `undo`/`redo` pop an item and return
//!   its metadata (the "stack item popped" event).
//!
//! A CRDT library or the bundled [`MemoryStore`](crate::MemoryStore) can
//! satisfy it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A value in the store: a string leaf or a nested map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreValue {
    Str(String),
    Map(BTreeMap<String, StoreValue>),
}

impl StoreValue {
    /// An empty map
    pub fn map() -> Self {
        StoreValue::Map(BTreeMap::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StoreValue::Str(s) => Some(s),
            StoreValue::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, StoreValue>> {
        match self {
            StoreValue::Map(m) => Some(m),
            StoreValue::Str(_) => None,
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, StoreValue::Map(_))
    }

    /// Value at `path`; the empty path is `self`
    pub fn get_path(&self, path: &[String]) -> Option<&StoreValue> {
        let mut cursor = self;
        for key in path {
            cursor = cursor.as_map()?.get(key)?;
        }
        Some(cursor)
    }

    fn parent_map_mut(
        &mut self,
        path: &[String],
    ) -> Result<Option<&mut BTreeMap<String, StoreValue>>, StoreError> {
        let mut cursor = self;
        for (depth, key) in path.iter().enumerate() {
            cursor = match cursor {
                StoreValue::Map(m) => match m.get_mut(key) {
                    Some(next) => next,
                    None => return Ok(None),
                },
                StoreValue::Str(_) => return Err(StoreError::NotAMap(join(&path[..depth]))),
            };
        }
        match cursor {
            StoreValue::Map(m) => Ok(Some(m)),
            StoreValue::Str(_) => Err(StoreError::NotAMap(join(path))),
        }
    }

    /// Write `value` at `path`, returning the previous value
    pub fn set_path(
        &mut self,
        path: &[String],
        value: StoreValue,
    ) -> Result<Option<StoreValue>, StoreError> {
        let (key, parent) = path.split_last().ok_or(StoreError::EmptyPath)?;
        let map = self
            .parent_map_mut(parent)?
            .ok_or_else(|| StoreError::MissingParent(join(path)))?;
        Ok(map.insert(key.clone(), value))
    }

    /// Remove the value at `path`, returning it
    pub fn delete_path(&mut self, path: &[String]) -> Result<Option<StoreValue>, StoreError> {
        let (key, parent) = path.split_last().ok_or(StoreError::EmptyPath)?;
        match self.parent_map_mut(parent)? {
            Some(map) => Ok(map.remove(key)),
            None => Ok(None),
        }
    }
}

impl From<&str> for StoreValue {
    fn from(s: &str) -> Self {
        StoreValue::Str(s.to_string())
    }
}

impl From<String> for StoreValue {
    fn from(s: String) -> Self {
        StoreValue::Str(s)
    }
}

impl From<BTreeMap<String, StoreValue>> for StoreValue {
    fn from(m: BTreeMap<String, StoreValue>) -> Self {
        StoreValue::Map(m)
    }
}

impl<K: Into<String>, V: Into<StoreValue>> FromIterator<(K, V)> for StoreValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        StoreValue::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

pub(crate) fn join(path: &[String]) -> String {
    format!("/{}", path.join("/"))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Empty path")]
    EmptyPath,

    #[error("Parent map missing for {0}")]
    MissingParent(String),

    #[error("Value at {0} is not a map")]
    NotAMap(String),

    #[error("A capture is already open")]
    CaptureActive,

    #[error("No capture is open")]
    NoCapture,
}

/// Kind of a single key change reported to deep observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub path: Vec<String>,
    pub kind: ChangeKind,
    pub old_value: Option<StoreValue>,
}

/// What caused a batch of changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A write made while no capture was open
    Direct,
    /// A tracked capture
    Local,
    /// A capture that bypasses the undo manager
    Untracked,
    Undo,
    Redo,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub origin: ChangeOrigin,
    pub changes: Vec<KeyChange>,
}

pub type StoreObserver = Box<dyn FnMut(&StoreEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Metadata slot attached to each undo stack item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackMeta {
    pub version_before: Option<u64>,
    pub version_after: Option<u64>,
}

/// Path-addressed nested map. Shared by stores and plain value trees so
/// patches can be replayed onto either.
pub trait NestedMap {
    fn get(&self, path: &[String]) -> Option<StoreValue>;

    fn set(&mut self, path: &[String], value: StoreValue) -> Result<Option<StoreValue>, StoreError>;

    fn delete(&mut self, path: &[String]) -> Result<Option<StoreValue>, StoreError>;

    /// Keys of the map at `path` (empty when absent or not a map)
    fn keys(&self, path: &[String]) -> Vec<String> {
        match self.get(path) {
            Some(StoreValue::Map(m)) => m.into_keys().collect(),
            _ => Vec::new(),
        }
    }
}

impl NestedMap for StoreValue {
    fn get(&self, path: &[String]) -> Option<StoreValue> {
        self.get_path(path).cloned()
    }

    fn set(&mut self, path: &[String], value: StoreValue) -> Result<Option<StoreValue>, StoreError> {
        self.set_path(path, value)
    }

    fn delete(&mut self, path: &[String]) -> Result<Option<StoreValue>, StoreError> {
        self.delete_path(path)
    }
}

/// Replicated, observable document substrate with an embedded undo manager
pub trait SharedDocumentStore: NestedMap {
    /// Deep copy of the whole document
    fn snapshot(&self) -> StoreValue;

    fn observe_deep(&mut self, observer: StoreObserver) -> ObserverId;

    fn unobserve(&mut self, id: ObserverId) -> bool;

    /// Start grouping writes. `tracked = false` keeps them out of the undo stack.
    fn begin_capture(&mut self, tracked: bool) -> Result<(), StoreError>;

    /// Close the group. Returns the metadata slot of the stack item it
    /// pushed, if any.
    fn end_capture(&mut self) -> Result<Option<&mut StackMeta>, StoreError>;

    /// Close the group and restore every value it changed
    fn rollback_capture(&mut self) -> Result<(), StoreError>;

    fn is_capturing(&self) -> bool;

    fn can_undo(&self) -> bool;

    fn can_redo(&self) -> bool;

    /// Revert the newest stack item and return its metadata
    fn undo(&mut self) -> Result<Option<StackMeta>, StoreError>;

    /// Reapply the newest undone item and return its metadata
    fn redo(&mut self) -> Result<Option<StackMeta>, StoreError>;

    fn undo_depth(&self) -> usize;

    fn redo_depth(&self) -> usize;

    fn clear_redo(&mut self);

    fn clear_history(&mut self);

    /// Drop the oldest undo items until at most `keep` remain
    fn truncate_undo(&mut self, keep: usize);
}
