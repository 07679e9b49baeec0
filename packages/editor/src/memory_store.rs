//! # Memory Store
//!
//! Single-process [`SharedDocumentStore`]. Every write is logged as a
//! `(path, old, new)` change; undo replays a stack item's changes backwards
//! restoring `old`, redo replays them forwards writing `new`. A replayed
//! write whose parent map has since been removed is skipped.

use crate::store::{
    join, ChangeKind, ChangeOrigin, KeyChange, NestedMap, ObserverId, SharedDocumentStore,
    StackMeta, StoreError, StoreEvent, StoreObserver, StoreValue,
};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Change {
    path: Vec<String>,
    old: Option<StoreValue>,
    new: Option<StoreValue>,
}

impl Change {
    fn key_change(&self, old: Option<StoreValue>, new_present: bool) -> KeyChange {
        let kind = match (&old, new_present) {
            (None, _) => ChangeKind::Added,
            (Some(_), true) => ChangeKind::Updated,
            (Some(_), false) => ChangeKind::Deleted,
        };
        KeyChange {
            path: self.path.clone(),
            kind,
            old_value: old,
        }
    }
}

#[derive(Debug)]
struct Capture {
    tracked: bool,
    changes: Vec<Change>,
}

#[derive(Debug)]
struct StackItem {
    changes: Vec<Change>,
    meta: StackMeta,
}

pub struct MemoryStore {
    root: StoreValue,
    capture: Option<Capture>,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    observers: Vec<(ObserverId, StoreObserver)>,
    next_observer: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: StoreValue::map(),
            capture: None,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Store seeded with `root` (must be a map)
    pub fn with_root(root: StoreValue) -> Result<Self, StoreError> {
        if !root.is_map() {
            return Err(StoreError::NotAMap("/".to_string()));
        }
        Ok(Self {
            root,
            ..Self::new()
        })
    }

    fn record(&mut self, change: Change, old: Option<StoreValue>) {
        let key_change = change.key_change(old, change.new.is_some());
        match &mut self.capture {
            Some(capture) => capture.changes.push(change),
            None => self.notify(ChangeOrigin::Direct, vec![key_change]),
        }
    }

    fn notify(&mut self, origin: ChangeOrigin, changes: Vec<KeyChange>) {
        if changes.is_empty() {
            return;
        }
        let event = StoreEvent { origin, changes };
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
    }

    fn write_raw(
        &mut self,
        path: &[String],
        value: Option<StoreValue>,
    ) -> Result<Option<StoreValue>, StoreError> {
        match value {
            Some(value) => self.root.set_path(path, value),
            None => self.root.delete_path(path),
        }
    }

    /// Write `value_of(change)` for each change in turn.
    ///
    /// A write under a map that no longer exists is skipped. Any other failure
    /// restores what this call already wrote before returning the error.
    fn write_all<'c>(
        &mut self,
        changes: impl Iterator<Item = &'c Change>,
        value_of: impl Fn(&Change) -> Option<StoreValue>,
    ) -> Result<Vec<KeyChange>, StoreError> {
        let mut reported = Vec::new();
        let mut written: Vec<(&'c Change, Option<StoreValue>)> = Vec::new();
        for change in changes {
            let value = value_of(change);
            let present = value.is_some();
            match self.write_raw(&change.path, value) {
                Ok(None) if !present => {}
                Ok(previous) => {
                    reported.push(change.key_change(previous.clone(), present));
                    written.push((change, previous));
                }
                Err(StoreError::MissingParent(_)) | Err(StoreError::NotAMap(_)) => {
                    debug!(path = %join(&change.path), "Skipped write under a removed map");
                }
                Err(err) => {
                    for (change, previous) in written.into_iter().rev() {
                        if let Err(restore) = self.write_raw(&change.path, previous) {
                            warn!(path = %join(&change.path), error = %restore, "Could not restore value");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(reported)
    }

    /// Replay `changes` backwards, restoring each old value
    fn unwind(&mut self, changes: &[Change]) -> Result<Vec<KeyChange>, StoreError> {
        self.write_all(changes.iter().rev(), |change| change.old.clone())
    }

    /// Replay `changes` forwards, writing each new value
    fn replay(&mut self, changes: &[Change]) -> Result<Vec<KeyChange>, StoreError> {
        self.write_all(changes.iter(), |change| change.new.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("root", &self.root)
            .field("capturing", &self.capture.is_some())
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl NestedMap for MemoryStore {
    fn get(&self, path: &[String]) -> Option<StoreValue> {
        self.root.get_path(path).cloned()
    }

    fn set(&mut self, path: &[String], value: StoreValue) -> Result<Option<StoreValue>, StoreError> {
        let old = self.root.set_path(path, value.clone())?;
        let change = Change {
            path: path.to_vec(),
            old: old.clone(),
            new: Some(value),
        };
        self.record(change, old.clone());
        Ok(old)
    }

    fn delete(&mut self, path: &[String]) -> Result<Option<StoreValue>, StoreError> {
        let old = self.root.delete_path(path)?;
        if old.is_some() {
            let change = Change {
                path: path.to_vec(),
                old: old.clone(),
                new: None,
            };
            self.record(change, old.clone());
        }
        Ok(old)
    }
}

impl SharedDocumentStore for MemoryStore {
    fn snapshot(&self) -> StoreValue {
        self.root.clone()
    }

    fn observe_deep(&mut self, observer: StoreObserver) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    fn begin_capture(&mut self, tracked: bool) -> Result<(), StoreError> {
        if self.capture.is_some() {
            return Err(StoreError::CaptureActive);
        }
        self.capture = Some(Capture {
            tracked,
            changes: Vec::new(),
        });
        Ok(())
    }

    fn end_capture(&mut self) -> Result<Option<&mut StackMeta>, StoreError> {
        let capture = self.capture.take().ok_or(StoreError::NoCapture)?;
        let origin = if capture.tracked {
            ChangeOrigin::Local
        } else {
            ChangeOrigin::Untracked
        };
        let reported = capture
            .changes
            .iter()
            .map(|c| c.key_change(c.old.clone(), c.new.is_some()))
            .collect();
        self.notify(origin, reported);

        if !capture.tracked || capture.changes.is_empty() {
            return Ok(None);
        }
        self.redo_stack.clear();
        self.undo_stack.push(StackItem {
            changes: capture.changes,
            meta: StackMeta::default(),
        });
        Ok(self.undo_stack.last_mut().map(|item| &mut item.meta))
    }

    fn rollback_capture(&mut self) -> Result<(), StoreError> {
        let capture = self.capture.take().ok_or(StoreError::NoCapture)?;
        let reported = self.unwind(&capture.changes)?;
        self.notify(ChangeOrigin::Rollback, reported);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    fn undo(&mut self) -> Result<Option<StackMeta>, StoreError> {
        if self.capture.is_some() {
            return Err(StoreError::CaptureActive);
        }
        let Some(item) = self.undo_stack.pop() else {
            return Ok(None);
        };
        let reported = match self.unwind(&item.changes) {
            Ok(reported) => reported,
            Err(err) => {
                self.undo_stack.push(item);
                return Err(err);
            }
        };
        let meta = item.meta;
        self.redo_stack.push(item);
        self.notify(ChangeOrigin::Undo, reported);
        Ok(Some(meta))
    }

    fn redo(&mut self) -> Result<Option<StackMeta>, StoreError> {
        if self.capture.is_some() {
            return Err(StoreError::CaptureActive);
        }
        let Some(item) = self.redo_stack.pop() else {
            return Ok(None);
        };
        let reported = match self.replay(&item.changes) {
            Ok(reported) => reported,
            Err(err) => {
                self.redo_stack.push(item);
                return Err(err);
            }
        };
        let meta = item.meta;
        self.undo_stack.push(item);
        self.notify(ChangeOrigin::Redo, reported);
        Ok(Some(meta))
    }

    fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    fn clear_history(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    fn truncate_undo(&mut self, keep: usize) {
        if self.undo_stack.len() > keep {
            let excess = self.undo_stack.len() - keep;
            self.undo_stack.drain(..excess);
        }
    }
}
