//! Node records and their store encoding.
//!
//! A node lives at `["nodes", id]` as a nested string map:
//!
//! ```text
//! { id, type, parent?, order?, style: { .. }, content? }
//! ```

use crate::errors::EditorError;
use crate::store::StoreValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id of the single root node of every document
pub const ROOT_NODE_ID: &str = "root";

/// Key of the node table in the document store
pub const NODES_KEY: &str = "nodes";

pub(crate) const FIELD_PARENT: &str = "parent";
pub(crate) const FIELD_ORDER: &str = "order";
pub(crate) const FIELD_STYLE: &str = "style";
pub(crate) const FIELD_CONTENT: &str = "content";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Block,
    Text,
    Fragment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default)]
    pub style: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Node {
    pub fn root() -> Self {
        Self {
            id: ROOT_NODE_ID.to_string(),
            kind: NodeKind::Root,
            parent: None,
            order: None,
            style: BTreeMap::new(),
            content: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == NodeKind::Root
    }

    pub fn is_text(&self) -> bool {
        self.kind == NodeKind::Text
    }

    pub(crate) fn to_value(&self) -> Result<StoreValue, EditorError> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    pub(crate) fn from_value(value: &StoreValue) -> Result<Self, EditorError> {
        let json = serde_json::to_value(value)?;
        serde_json::from_value(json)
            .map_err(|err| EditorError::Corrupt(format!("node record: {}", err)))
    }
}

/// Fields of a node about to be inserted. The tree assigns id, parent and
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInit {
    pub kind: NodeKind,
    pub style: BTreeMap<String, String>,
    pub content: Option<String>,
}

impl NodeInit {
    pub fn block() -> Self {
        Self {
            kind: NodeKind::Block,
            style: BTreeMap::new(),
            content: None,
        }
    }

    pub fn fragment() -> Self {
        Self {
            kind: NodeKind::Fragment,
            ..Self::block()
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Text,
            content: Some(content.into()),
            ..Self::block()
        }
    }

    pub fn with_style(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.style.insert(key.into(), value.into());
        self
    }
}
