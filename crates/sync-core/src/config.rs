//! Tunables of a synchronization run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_entries_per_chunk must be positive, got {0}")]
    NonPositiveChunkSize(i32),

    #[error("conflict_timestamp_format must not be empty")]
    EmptyTimestampFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Page size requested from the remote change feed.
    pub max_entries_per_chunk: i32,
    /// Download resource bodies with full notes.
    pub fetch_resource_data: bool,
    pub fetch_resource_recognition: bool,
    pub fetch_resource_alternate_data: bool,
    /// chrono format for the timestamp in conflict-renamed display keys.
    pub conflict_timestamp_format: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_entries_per_chunk: 50,
            fetch_resource_data: true,
            fetch_resource_recognition: false,
            fetch_resource_alternate_data: false,
            conflict_timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries_per_chunk <= 0 {
            return Err(ConfigError::NonPositiveChunkSize(self.max_entries_per_chunk));
        }
        if self.conflict_timestamp_format.trim().is_empty() {
            return Err(ConfigError::EmptyTimestampFormat);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert_eq!(config.max_entries_per_chunk, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let config = SyncConfig {
            max_entries_per_chunk: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveChunkSize(0)));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"max_entries_per_chunk": 10}"#).unwrap();
        assert_eq!(config.max_entries_per_chunk, 10);
        assert!(config.fetch_resource_data);
    }
}
