//! Persistence for the local store and the sync checkpoint.
//!
//! Both are kept in `.sync/state.json` within the store directory so a later
//! run can continue incrementally.

use anyhow::{Context, Result};
use note_sync_core::{InMemoryStorage, SyncCheckpoint};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub checkpoint: SyncCheckpoint,
    pub storage: InMemoryStorage,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(store_dir: &Path) -> Self {
        Self {
            path: store_dir.join(".sync").join("state.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the previous state, or an empty one on first run.
    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            debug!("No state at {:?}, starting empty", self.path);
            return Ok(PersistedState::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {:?}", self.path))?;
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state file: {:?}", self.path))?;
        Ok(state)
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {:?}", parent))?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write state file: {:?}", self.path))?;
        debug!("Saved {} entities to {:?}", state.storage.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use note_sync_core::types::Tag;
    use note_sync_core::{EntityKind, Guid};
    use tempfile::TempDir;

    #[test]
    fn test_first_run_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path());

        let state = store.load().unwrap();

        assert_eq!(state.checkpoint, SyncCheckpoint::default());
        assert!(state.storage.is_empty());
    }

    #[test]
    fn test_state_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let linked = Guid::generate();

        {
            let store = StateStore::new(temp_dir.path());
            let mut storage = InMemoryStorage::new();
            storage
                .add(
                    Tag {
                        name: "Work".into(),
                        dirty: true,
                        ..Default::default()
                    }
                    .into(),
                )
                .unwrap();
            let mut checkpoint = SyncCheckpoint::new(12);
            checkpoint.linked_after_usn.insert(linked.clone(), 4);
            store.save(&PersistedState { checkpoint, storage }).unwrap();
        }

        assert!(temp_dir.path().join(".sync/state.json").exists());

        let state = StateStore::new(temp_dir.path()).load().unwrap();
        assert_eq!(state.checkpoint.after_usn, 12);
        assert_eq!(state.checkpoint.linked_after_usn.get(&linked), Some(&4));
        assert_eq!(state.storage.len(), 1);
        assert!(state.storage.find_by_name(EntityKind::Tag, "work").is_some());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "not json").unwrap();

        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse state file"));
    }
}
