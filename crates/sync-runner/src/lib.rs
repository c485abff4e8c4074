//! note-sync runner: executes the sync-core state machines on tokio.
//!
//! Exposed as a library so integration tests can drive whole runs.

pub mod config;
pub mod driver;
pub mod fixture;
pub mod persistence;
pub mod storage_worker;
pub mod timers;

pub use config::{AuthConfig, RunnerConfig};
pub use driver::{SyncDriver, SyncOutcome};
pub use fixture::FixtureError;
pub use persistence::{PersistedState, StateStore};
pub use storage_worker::StorageWorker;
pub use timers::TimerScheduler;
