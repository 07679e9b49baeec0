use canvas_common::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_NAME: &str = "canvas.config.json";

/// Editor configuration file format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorConfig {
    /// Maximum number of undo steps kept (0 = unlimited)
    #[serde(default = "default_max_undo_levels")]
    pub max_undo_levels: usize,

    /// Fractional digits an order key may reach before its siblings are re-keyed
    #[serde(default = "default_max_order_digits")]
    pub max_order_digits: usize,

    /// What happens to partial writes when a transaction callback fails
    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Prefix of generated node ids
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Extra attempts `transform_with_retry` makes after a transient failure
    #[serde(default = "default_transient_retries")]
    pub transient_retries: usize,
}

fn default_transient_retries() -> usize {
    2
}

fn default_max_undo_levels() -> usize {
    100
}

fn default_max_order_digits() -> usize {
    32
}

fn default_client_id() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorPolicy {
    /// Discard everything the outermost transaction wrote
    #[default]
    Rollback,
    /// Keep what was written before the failure and commit it
    CommitPartial,
}

impl EditorConfig {
    /// Load config from a directory, falling back to defaults
    pub fn load(fs: &dyn FileSystem, dir: &Path) -> anyhow::Result<Self> {
        let config_path = dir.join(DEFAULT_CONFIG_NAME);

        if fs.exists(&config_path) {
            let content = fs.read_to_string(&config_path)?;
            Self::from_json(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: EditorConfig = serde_json::from_str(content)?;
        if config.client_id.is_empty() {
            anyhow::bail!("clientId must not be empty");
        }
        Ok(config)
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            max_undo_levels: default_max_undo_levels(),
            max_order_digits: default_max_order_digits(),
            error_policy: ErrorPolicy::default(),
            client_id: default_client_id(),
            transient_retries: default_transient_retries(),
        }
    }
}
