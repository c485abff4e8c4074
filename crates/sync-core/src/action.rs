//! Effects requested by the state machines and the replies fed back to them.
//!
//! The orchestrator and the uploader never perform I/O themselves. Each call
//! returns a list of [`SyncAction`]s; the caller executes them and feeds every
//! result back, correlated by [`RequestId`] or [`TimerId`].

use crate::events::SyncEvent;
use crate::fault::RemoteError;
use crate::storage::StorageRequest;
use crate::types::{Guid, LinkedNotebook, Note, RequestId, SyncChunk, SyncChunkFilter, Usn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Handle of a one-shot deferred callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

impl Display for TimerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Something the driver must do on behalf of a state machine.
#[derive(Debug, Clone)]
pub enum SyncAction {
    /// Send a request to the local storage service.
    Storage(StorageRequest),
    /// Call the remote note service.
    Remote(RemoteCall),
    /// Fire `TimerId` once after `delay`.
    ArmTimer { id: TimerId, delay: Duration },
    /// Drop a previously armed timer; it must not fire anymore.
    CancelTimer(TimerId),
    /// Publish a notification to the controller layer.
    Notify(SyncEvent),
}

/// Which parts of a note a full-note fetch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteFetchOptions {
    pub with_content: bool,
    pub with_resources_data: bool,
    pub with_resources_recognition: bool,
    pub with_resources_alternate_data: bool,
}

#[derive(Debug, Clone)]
pub enum RemoteRequest {
    SyncChunk {
        after_usn: Usn,
        max_entries: i32,
        filter: SyncChunkFilter,
    },
    LinkedNotebookSyncChunk {
        linked_notebook: LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
        auth_token: String,
        full_sync_only: bool,
    },
    FullNote {
        guid: Guid,
        options: NoteFetchOptions,
    },
}

#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub id: RequestId,
    pub request: RemoteRequest,
}

#[derive(Debug, Clone)]
pub enum RemotePayload {
    SyncChunk(SyncChunk),
    Note(Note),
}

#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub id: RequestId,
    pub result: Result<RemotePayload, RemoteError>,
}
