//! Contract of the local storage service.
//!
//! The storage engine runs as a separate worker reached only by message
//! passing: every request carries a fresh [`RequestId`] and is answered by
//! exactly one [`StorageResponse`] with the same id. Nothing in this crate
//! calls the storage synchronously.
//!
//! Implementations:
//! - `InMemoryStorage` - in-process store used by tests and the runner

mod memory;

pub use memory::{InMemoryStorage, StorageError};

use crate::entity::{Entity, EntityKind};
use crate::types::{Guid, RequestId};
use serde::{Deserialize, Serialize};

/// Which entities a listing request returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    /// Entities with local edits pending upload.
    pub dirty: bool,
    /// Entities created locally that never round-tripped.
    pub local: bool,
}

impl ListFilter {
    pub fn dirty_or_new() -> Self {
        Self {
            dirty: true,
            local: true,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        use crate::entity::SyncEntity;
        (self.dirty && entity.is_dirty()) || (self.local && entity.is_local())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageOp {
    /// Look up the local entity of the query's kind with the query's guid.
    FindByGuid(Entity),
    /// Case-insensitive lookup by the query's display key.
    FindByName(Entity),
    Add(Entity),
    Update(Entity),
    Expunge { kind: EntityKind, guid: Guid },
    ListDirtyOrNew { kind: EntityKind, filter: ListFilter },
    ListAll { kind: EntityKind },
}

impl StorageOp {
    pub fn name(&self) -> &'static str {
        match self {
            StorageOp::FindByGuid(_) => "find by guid",
            StorageOp::FindByName(_) => "find by name",
            StorageOp::Add(_) => "add",
            StorageOp::Update(_) => "update",
            StorageOp::Expunge { .. } => "expunge",
            StorageOp::ListDirtyOrNew { .. } => "list dirty or new",
            StorageOp::ListAll { .. } => "list all",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageRequest {
    pub id: RequestId,
    pub op: StorageOp,
}

impl StorageRequest {
    pub fn new(op: StorageOp) -> Self {
        Self {
            id: RequestId::new(),
            op,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoragePayload {
    /// Found, added or updated entity as now stored.
    Entity(Entity),
    Entities(Vec<Entity>),
    Expunged,
}

/// Failure reply. For lookups this is the ordinary "not found" answer.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageFailure {
    pub entity: Option<Entity>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageResponse {
    pub id: RequestId,
    pub result: Result<StoragePayload, StorageFailure>,
}
