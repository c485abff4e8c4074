//! Runner configuration, loaded from YAML.
//!
//! ```yaml
//! sync:
//!   max_entries_per_chunk: 100
//! auth:
//!   token: "S=s1:U=..."
//!   linked_notebooks:
//!     5c7e0f0a-...:
//!       token: "S=s2:..."
//!       expiresMs: 1735689600000
//! store_path: ./state
//! remote_fixture: ./account.json
//! ```

use anyhow::{Context, Result};
use note_sync_core::{Guid, LinkedNotebookAuth, SyncConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Tokens handed to the sync engine when it asks for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Account token, also used to answer re-authentication requests.
    pub token: String,
    pub linked_notebooks: HashMap<Guid, LinkedNotebookAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub sync: SyncConfig,
    pub auth: AuthConfig,
    /// Directory holding the persisted local store and checkpoint.
    pub store_path: Option<PathBuf>,
    /// JSON account snapshot served as the remote note service.
    pub remote_fixture: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RunnerConfig = serde_yaml::from_str(content)?;
        config.sync.validate()?;
        Ok(config)
    }
}
