//! Remote account fixtures: a JSON [`AccountSnapshot`] served through the
//! in-memory note service.

use note_sync_core::{AccountSnapshot, InMemoryNoteService};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to read fixture {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse fixture {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, FixtureError>;

pub fn load_snapshot(path: &Path) -> Result<AccountSnapshot> {
    let content = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| FixtureError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_service(path: &Path) -> Result<InMemoryNoteService> {
    load_snapshot(path).map(InMemoryNoteService::from_snapshot)
}
