//! Error types for the editor

use crate::store::StoreError;
use crate::tracker::PatchError;
use canvas_common::CommonError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EditorError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No document for scope {0}")]
    ScopeNotFound(String),

    #[error("A document already exists for scope {0}")]
    DocumentExists(String),

    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),

    #[error("Node {id} has no {direction} sibling")]
    NoSibling { id: String, direction: &'static str },

    #[error("Cycle detected: cannot move a node into its own subtree")]
    CycleDetected,

    #[error("The root node cannot be moved or removed")]
    RootImmutable,

    #[error("Not a text node: {0}")]
    NotText(String),

    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    #[error("Node {node} is not a child of {parent}")]
    NotASibling { node: String, parent: String },

    #[error("Edit session {0} is not open")]
    SessionNotOpen(String),

    #[error("{0} is not allowed inside a transaction")]
    InTransaction(&'static str),

    #[error("Corrupt document: {0}")]
    Corrupt(String),

    #[error("Order error: {0}")]
    Order(#[from] CommonError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EditorError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EditorError::NodeNotFound(_) | EditorError::ScopeNotFound(_)
        )
    }

    /// Failures raised before anything was written, which a later attempt
    /// may not hit
    pub fn is_transient(&self) -> bool {
        matches!(self, EditorError::Store(StoreError::CaptureActive))
    }
}
