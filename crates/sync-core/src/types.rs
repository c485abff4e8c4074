//! Data model shared by the remote client, the local storage contract and
//! the synchronization state machines.
//!
//! Every entity carries two identities: an optional remote `Guid` assigned by
//! the note service, and a `LocalId` assigned once on this device. The local id
//! never leaves the device and is never reused.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Update sequence number. Every remote mutation bumps the account counter.
pub type Usn = i32;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Length of a well-formed remote guid (UUID text form).
pub const GUID_LEN: usize = 36;

/// Remote-service-assigned stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

impl Guid {
    /// Wrap a guid received from the remote service without validating it.
    ///
    /// Use [`Guid::is_well_formed`] before trusting it.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random guid (used by the in-memory note service).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Whether the guid has the shape the note service always assigns.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == GUID_LEN && Uuid::parse_str(&self.0).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Guid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Device-local identifier, assigned once and never sent to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id for an asynchronous local-storage or remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a pull starts from scratch or continues from a previous USN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn for_after_usn(after_usn: Usn) -> Self {
        if after_usn == 0 {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        }
    }
}

/// Operations the owner of a shared notebook has forbidden.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotebookRestrictions {
    pub no_create_notes: bool,
    pub no_update_notes: bool,
    pub no_create_tags: bool,
    pub no_update_tags: bool,
    pub no_update_notebook: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Notebook {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub name: String,
    pub stack: Option<String>,
    pub default_notebook: bool,
    pub published: bool,
    pub publishing_uri: Option<String>,
    pub publishing_description: Option<String>,
    pub updated: Option<Timestamp>,
    pub restrictions: Option<NotebookRestrictions>,
    /// Set when the notebook belongs to another account's shared notebook.
    pub linked_notebook_guid: Option<Guid>,
    pub dirty: bool,
    pub local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resource {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub note_guid: Option<Guid>,
    pub note_local_id: Option<LocalId>,
    pub mime: Option<String>,
    pub data_hash: Option<String>,
    pub data_size: Option<i32>,
    pub data: Option<Vec<u8>>,
    pub dirty: bool,
    pub local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Note {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub title: String,
    /// ENML body. Sync chunks never carry it; only a full-note fetch does.
    pub content: Option<String>,
    pub content_length: Option<i32>,
    pub created: Option<Timestamp>,
    pub updated: Option<Timestamp>,
    pub active: bool,
    pub notebook_guid: Option<Guid>,
    pub notebook_local_id: Option<LocalId>,
    pub tag_guids: Vec<Guid>,
    pub resources: Vec<Resource>,
    pub dirty: bool,
    pub local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tag {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub name: String,
    pub parent_guid: Option<Guid>,
    pub linked_notebook_guid: Option<Guid>,
    pub dirty: bool,
    pub local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SavedSearch {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub name: String,
    pub query: Option<String>,
    pub dirty: bool,
    pub local: bool,
}

/// Local pointer to another account's shared notebook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkedNotebook {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub share_name: String,
    pub username: Option<String>,
    pub shard_id: Option<String>,
    /// Key used by the owner's service to authenticate access to the share.
    pub shared_notebook_global_id: Option<String>,
    pub uri: Option<String>,
    pub note_store_url: Option<String>,
    pub stack: Option<String>,
    pub dirty: bool,
    pub local: bool,
}

/// One page of the remote change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncChunk {
    pub current_time: Timestamp,
    /// Highest USN represented in this page; absent when the page is empty.
    pub chunk_high_usn: Option<Usn>,
    /// USN of the account head at the time of the request.
    pub update_count: Usn,
    pub notes: Vec<Note>,
    pub notebooks: Vec<Notebook>,
    pub tags: Vec<Tag>,
    pub searches: Vec<SavedSearch>,
    pub resources: Vec<Resource>,
    pub linked_notebooks: Vec<LinkedNotebook>,
    pub expunged_notes: Vec<Guid>,
    pub expunged_notebooks: Vec<Guid>,
    pub expunged_tags: Vec<Guid>,
    pub expunged_searches: Vec<Guid>,
    pub expunged_linked_notebooks: Vec<Guid>,
}

impl SyncChunk {
    /// Whether this page brings the puller up to the account head.
    pub fn reaches_head(&self) -> bool {
        match self.chunk_high_usn {
            Some(high) => high >= self.update_count,
            None => true,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.notes.len()
            + self.notebooks.len()
            + self.tags.len()
            + self.searches.len()
            + self.resources.len()
            + self.linked_notebooks.len()
    }
}

/// Which entity collections a sync chunk request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChunkFilter {
    pub include_notebooks: bool,
    pub include_notes: bool,
    pub include_note_resources: bool,
    pub include_note_attributes: bool,
    pub include_tags: bool,
    pub include_searches: bool,
    pub include_resources: bool,
    pub include_linked_notebooks: bool,
    pub include_expunged: bool,
    pub include_note_application_data_full_map: bool,
    pub include_resource_application_data_full_map: bool,
    pub include_note_resource_application_data_full_map: bool,
}

impl SyncChunkFilter {
    /// Filter requested on every account chunk pull.
    ///
    /// Expunged ids only matter when there is local state to remove them from.
    pub fn for_mode(mode: SyncMode) -> Self {
        Self {
            include_notebooks: true,
            include_notes: true,
            include_note_resources: true,
            include_note_attributes: true,
            include_tags: true,
            include_searches: true,
            include_resources: true,
            include_linked_notebooks: true,
            include_expunged: mode == SyncMode::Incremental,
            include_note_application_data_full_map: true,
            include_resource_application_data_full_map: true,
            include_note_resource_application_data_full_map: true,
        }
    }
}

/// Source of the current time, injectable for tests.
pub trait Clock: Send {
    fn now_ms(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock frozen at a given instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now_ms(&self) -> Timestamp {
        self.0
    }
}
