//! # Canvas Editor
//!
//! Document model beneath an interactive canvas editor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ service: ModelService                       │
//! │  - Transactions (nested, re-entrant)        │
//! │  - One history entry per transaction        │
//! │  - Undo/redo across documents               │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ node_tree: NodeTree / TreeMut per scope     │
//! │  - Insert/remove/reparent/reorder           │
//! │  - Fractional sibling order                 │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ tracker: patches for every write            │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ store: SharedDocumentStore (+ undo manager) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **The store is the source of truth**: trees decode from it on read
//! 2. **Writes only inside transactions**: every write becomes a patch
//! 3. **Inserts never touch neighbours**: order keys are minted in between
//! 4. **One user action, one undo step**: even across documents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use canvas_common::ScopeRegistry;
//! use canvas_editor::{EditorConfig, ModelService, NodeInit, Placement, ROOT_NODE_ID};
//!
//! let mut scopes = ScopeRegistry::new();
//! let page = scopes.intern(["", "page"]);
//!
//! let mut service = ModelService::new(EditorConfig::default());
//! service.create_document(&page)?;
//!
//! service.transform("Add card", |tx| {
//!     let mut tree = tx.tree(&page)?;
//!     let card = tree.insert(ROOT_NODE_ID, Placement::AsLastChild, NodeInit::block())?;
//!     tree.insert(&card, Placement::AsLastChild, NodeInit::text("Hello"))?;
//!     Ok(())
//! })?;
//!
//! service.undo()?;
//! ```

mod config;
mod errors;
mod memory_store;
mod node;
mod node_tree;
mod participants;
mod service;
mod store;
mod tracker;
mod undo_redo;

pub use config::{EditorConfig, ErrorPolicy, DEFAULT_CONFIG_NAME};
pub use errors::EditorError;
pub use memory_store::MemoryStore;
pub use node::{Node, NodeInit, NodeKind, NODES_KEY, ROOT_NODE_ID};
pub use node_tree::{NodeTree, Placement, RemoveScope, TreeMut};
pub use participants::{ChangeParticipant, ModelChange, ParticipantId, ParticipantRegistry};
pub use service::{
    DocumentModel, EditStackEntry, HistoryEntry, ModelService, SessionId, StoreFactory,
    Transaction,
};
pub use store::{
    ChangeKind, ChangeOrigin, KeyChange, NestedMap, ObserverId, SharedDocumentStore, StackMeta,
    StoreError, StoreEvent, StoreObserver, StoreValue,
};
pub use tracker::{
    apply, invert, revert, DocumentId, Handle, HandleArena, Patch, PatchError, PatchOp,
    PatchRecorder, Tracker, FORBIDDEN_SEGMENTS,
};
pub use undo_redo::{
    ContentChangedEmitter, ContentChangedEvent, ContentListener, ListenerId, UndoRedoStack,
};

// Re-export common types for convenience
pub use canvas_common::{Scope, ScopeRegistry, ScopedIdentifier};
