//! # Mutation Tracker
//!
//! Records every write made through a [`Tracker`] as a [`Patch`] while a
//! [`PatchRecorder`] window is open.
//!
//! ## Design
//!
//! - Nested maps are reached through generation-checked [`Handle`]s. Each
//!   handle slot stores its parent slot index and its key, so the absolute
//!   path of any write is rebuilt by walking parents. No back-pointers.
//! - Deleting (or overwriting) a map retires every handle beneath it; using
//!   a retired handle fails with [`PatchError::StaleHandle`].
//! - Writes always reach the target. Patches are only recorded while the
//!   recorder is open, in causal order, across every document touched.
//! - Old and new values are captured by value.
//!
//! ## Patch laws
//!
//! ```text
//! apply(pre, patches)          == post
//! revert(post, patches)        == pre
//! ```

use crate::store::{join, NestedMap, StoreError, StoreValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Path segments refused by [`apply`]
pub const FORBIDDEN_SEGMENTS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Identity of the document a patch was recorded against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u32);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// A single recorded write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<String>,
    pub document: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<StoreValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<StoreValue>,
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            PatchOp::Add => "add",
            PatchOp::Replace => "replace",
            PatchOp::Remove => "remove",
        };
        write!(f, "{} {}", op, join(&self.path))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Forbidden path segment: {0}")]
    ForbiddenSegment(String),

    #[error("Patch path is empty")]
    EmptyPath,

    #[error("Patch {0} carries no new value")]
    MissingValue(String),

    #[error("Handle is stale")]
    StaleHandle,

    #[error("No map at {0}")]
    NotAMap(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Generation-checked reference to a nested map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Entry {
    parent: Option<u32>,
    key: String,
    children: HashMap<String, u32>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena of handle slots, one per reached nested map
#[derive(Debug)]
pub struct HandleArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandleArena {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                entry: Some(Entry {
                    parent: None,
                    key: String::new(),
                    children: HashMap::new(),
                }),
            }],
            free: Vec::new(),
        }
    }

    /// Handle of the document root
    pub fn root(&self) -> Handle {
        Handle {
            index: 0,
            generation: self.slots[0].generation,
        }
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.entry(handle).is_ok()
    }

    /// Number of live handles, root included
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, handle: Handle) -> Result<&Entry, PatchError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(PatchError::StaleHandle)
    }

    /// Handle for `key` under `parent`, registered on first use
    pub fn child(&mut self, parent: Handle, key: &str) -> Result<Handle, PatchError> {
        if let Some(index) = self.entry(parent)?.children.get(key) {
            let index = *index;
            return Ok(Handle {
                index,
                generation: self.slots[index as usize].generation,
            });
        }

        let entry = Entry {
            parent: Some(parent.index),
            key: key.to_string(),
            children: HashMap::new(),
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        if let Some(parent_entry) = self.slots[parent.index as usize].entry.as_mut() {
            parent_entry.children.insert(key.to_string(), index);
        }
        Ok(Handle {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Absolute path of `handle`
    pub fn path_of(&self, handle: Handle) -> Result<Vec<String>, PatchError> {
        let mut entry = self.entry(handle)?;
        let mut path = Vec::new();
        while let Some(parent) = entry.parent {
            path.push(entry.key.clone());
            entry = self.slots[parent as usize]
                .entry
                .as_ref()
                .ok_or(PatchError::StaleHandle)?;
        }
        path.reverse();
        Ok(path)
    }

    /// Retire the handle registered for `key` under `parent` and its subtree
    pub fn retire(&mut self, parent: Handle, key: &str) -> Result<(), PatchError> {
        let removed = self.entry(parent)?.children.get(key).copied();
        if let Some(index) = removed {
            if let Some(parent_entry) = self.slots[parent.index as usize].entry.as_mut() {
                parent_entry.children.remove(key);
            }
            self.release(index);
        }
        Ok(())
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        let Some(entry) = slot.entry.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        for child in entry.children.into_values() {
            self.release(child);
        }
    }
}

impl Default for HandleArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-entrant recording window
#[derive(Debug, Default)]
pub struct PatchRecorder {
    depth: usize,
    patches: Vec<Patch>,
}

impl PatchRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn open(&mut self) {
        self.depth += 1;
    }

    /// Close one level. The outermost close drains every recorded patch.
    pub fn close(&mut self) -> Vec<Patch> {
        assert!(self.depth > 0, "patch recorder closed more often than opened");
        self.depth -= 1;
        if self.depth == 0 {
            std::mem::take(&mut self.patches)
        } else {
            Vec::new()
        }
    }

    /// Run `f` inside a recording window and return the patches it produced.
    ///
    /// Nested calls return their own patches and leave them in place for the
    /// enclosing window.
    pub fn produce<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> (R, Vec<Patch>) {
        let mark = self.patches.len();
        self.open();
        let result = f(self);
        let patches = if self.depth == 1 {
            self.close()
        } else {
            self.close();
            self.patches.get(mark..).map(<[Patch]>::to_vec).unwrap_or_default()
        };
        (result, patches)
    }

    pub fn pending(&self) -> &[Patch] {
        &self.patches
    }

    pub fn record(&mut self, patch: Patch) {
        if self.is_recording() {
            self.patches.push(patch);
        }
    }
}

/// Tracked accessor over a [`NestedMap`]
pub struct Tracker<'a, T: NestedMap + ?Sized> {
    target: &'a mut T,
    arena: &'a mut HandleArena,
    recorder: &'a mut PatchRecorder,
    document: DocumentId,
}

impl<'a, T: NestedMap + ?Sized> Tracker<'a, T> {
    pub fn new(
        target: &'a mut T,
        arena: &'a mut HandleArena,
        recorder: &'a mut PatchRecorder,
        document: DocumentId,
    ) -> Self {
        Self {
            target,
            arena,
            recorder,
            document,
        }
    }

    pub fn root(&self) -> Handle {
        self.arena.root()
    }

    pub fn path_of(&self, handle: Handle) -> Result<Vec<String>, PatchError> {
        self.arena.path_of(handle)
    }

    fn key_path(&self, handle: Handle, key: &str) -> Result<Vec<String>, PatchError> {
        let mut path = self.arena.path_of(handle)?;
        path.push(key.to_string());
        Ok(path)
    }

    /// Handle of the map stored at `key` under `parent`
    pub fn child(&mut self, parent: Handle, key: &str) -> Result<Handle, PatchError> {
        let path = self.key_path(parent, key)?;
        match self.target.get(&path) {
            Some(value) if value.is_map() => self.arena.child(parent, key),
            _ => Err(PatchError::NotAMap(join(&path))),
        }
    }

    pub fn get(&self, handle: Handle, key: &str) -> Result<Option<StoreValue>, PatchError> {
        let path = self.key_path(handle, key)?;
        Ok(self.target.get(&path))
    }

    /// Write `value` at `key`. Returns `false` when the value was unchanged.
    pub fn set(&mut self, handle: Handle, key: &str, value: StoreValue) -> Result<bool, PatchError> {
        let path = self.key_path(handle, key)?;
        let old = self.target.get(&path);
        if old.as_ref() == Some(&value) {
            return Ok(false);
        }

        self.target.set(&path, value.clone())?;
        if matches!(old, Some(StoreValue::Map(_))) {
            self.arena.retire(handle, key)?;
        }

        let op = if old.is_some() {
            PatchOp::Replace
        } else {
            PatchOp::Add
        };
        self.recorder.record(Patch {
            op,
            path,
            document: self.document,
            old_value: old,
            new_value: Some(value),
        });
        Ok(true)
    }

    /// Delete `key`. Returns `false` when it was absent.
    pub fn delete(&mut self, handle: Handle, key: &str) -> Result<bool, PatchError> {
        let path = self.key_path(handle, key)?;
        let Some(old) = self.target.delete(&path)? else {
            return Ok(false);
        };
        self.arena.retire(handle, key)?;
        self.recorder.record(Patch {
            op: PatchOp::Remove,
            path,
            document: self.document,
            old_value: Some(old),
            new_value: None,
        });
        Ok(true)
    }
}

/// Patch that undoes `patch`
pub fn invert(patch: &Patch) -> Patch {
    let op = match patch.op {
        PatchOp::Add => PatchOp::Remove,
        PatchOp::Replace => PatchOp::Replace,
        PatchOp::Remove => PatchOp::Add,
    };
    Patch {
        op,
        path: patch.path.clone(),
        document: patch.document,
        old_value: patch.new_value.clone(),
        new_value: patch.old_value.clone(),
    }
}

fn check_path(path: &[String]) -> Result<(), PatchError> {
    if path.is_empty() {
        return Err(PatchError::EmptyPath);
    }
    if let Some(segment) = path
        .iter()
        .find(|segment| FORBIDDEN_SEGMENTS.contains(&segment.as_str()))
    {
        return Err(PatchError::ForbiddenSegment(segment.clone()));
    }
    Ok(())
}

/// Replay `patches` onto `target` in order
pub fn apply<T: NestedMap + ?Sized>(target: &mut T, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        check_path(&patch.path)?;
        match patch.op {
            PatchOp::Add | PatchOp::Replace => {
                let value = patch
                    .new_value
                    .clone()
                    .ok_or_else(|| PatchError::MissingValue(patch.to_string()))?;
                target.set(&patch.path, value)?;
            }
            PatchOp::Remove => {
                target.delete(&patch.path)?;
            }
        }
    }
    Ok(())
}

/// Undo `patches` on `target`: inverted, newest first
pub fn revert<T: NestedMap + ?Sized>(target: &mut T, patches: &[Patch]) -> Result<(), PatchError> {
    let inverted: Vec<Patch> = patches.iter().rev().map(invert).collect();
    apply(target, &inverted)
}
