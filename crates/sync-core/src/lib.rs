//! note-sync-core: synchronization engine between a local note store and a
//! remote note service with a USN-based change feed.
//!
//! This crate provides:
//! - The entity model shared by both sides (notebooks, notes, tags, ...)
//! - Translation of remote faults into typed, actionable errors
//! - A typed client over the remote note service
//! - The download/merge orchestrator and the local change uploader, both as
//!   sans-IO state machines driven through [`SyncAction`]s
//! - In-memory storage and remote service implementations for tests and demos

pub mod action;
pub mod config;
pub mod download;
pub mod entity;
pub mod events;
pub mod fault;
pub mod remote;
pub mod storage;
pub mod types;
pub mod upload;

pub use action::{RemoteCall, RemotePayload, RemoteRequest, RemoteResponse, SyncAction, TimerId};
pub use config::{ConfigError, SyncConfig};
pub use download::{DownloadOrchestrator, LinkedNotebookAuth, SyncCheckpoint, SyncState};
pub use entity::{Entity, EntityKind, SyncEntity};
pub use events::{EventBus, LinkedNotebookRef, LinkedSyncProgress, Subscription, SyncEvent};
pub use fault::{ErrorKind, RemoteError, RemoteFault};
pub use remote::{AccountSnapshot, InMemoryNoteService, NoteService, RemoteNoteClient};
pub use storage::{InMemoryStorage, StorageRequest, StorageResponse};
pub use types::{Clock, FixedClock, Guid, LocalId, SystemClock, Usn};
pub use upload::{LocalChangeUploader, LocalChanges};
