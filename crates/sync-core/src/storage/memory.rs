use super::{ListFilter, StorageFailure, StorageOp, StoragePayload, StorageRequest, StorageResponse};
use crate::entity::{Entity, EntityKind, SyncEntity};
use crate::types::{Guid, LocalId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("guid {guid} is already used by another {kind}")]
    GuidInUse { kind: EntityKind, guid: Guid },

    #[error("note {note} references unknown notebook")]
    MissingNotebook { note: String },

    #[error("cannot change kind of {0}")]
    KindMismatch(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// In-process local store.
///
/// Entities are kept in insertion order so lookups are deterministic. Notes
/// must reference a stored notebook by local id, the same constraint a
/// relational backend enforces with a foreign key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryStorage {
    entities: Vec<Entity>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer one request. Every request gets exactly one response.
    pub fn handle(&mut self, request: StorageRequest) -> StorageResponse {
        let StorageRequest { id, op } = request;
        let op_name = op.name();
        let result = match op {
            StorageOp::FindByGuid(query) => match self.find_by_guid_of(&query) {
                Some(found) => Ok(StoragePayload::Entity(found.clone())),
                None => Err(StorageFailure {
                    description: format!("{} not found", query.describe()),
                    entity: Some(query),
                }),
            },
            StorageOp::FindByName(query) => match self.find_by_name_of(&query) {
                Some(found) => Ok(StoragePayload::Entity(found.clone())),
                None => Err(StorageFailure {
                    description: format!("{} not found", query.describe()),
                    entity: Some(query),
                }),
            },
            StorageOp::Add(entity) => Self::wrap(self.add(entity.clone()), entity),
            StorageOp::Update(entity) => Self::wrap(self.update(entity.clone()), entity),
            StorageOp::Expunge { kind, guid } => match self.expunge(kind, &guid) {
                Ok(()) => Ok(StoragePayload::Expunged),
                Err(e) => Err(StorageFailure {
                    entity: Some(Entity::with_guid(kind, guid)),
                    description: e.to_string(),
                }),
            },
            StorageOp::ListDirtyOrNew { kind, filter } => {
                Ok(StoragePayload::Entities(self.list(kind, filter)))
            }
            StorageOp::ListAll { kind } => Ok(StoragePayload::Entities(self.all(kind))),
        };

        if let Err(failure) = &result {
            tracing::trace!(request = %id, op = op_name, "{}", failure.description);
        }

        StorageResponse { id, result }
    }

    fn wrap(
        result: Result<Entity>,
        entity: Entity,
    ) -> std::result::Result<StoragePayload, StorageFailure> {
        result.map(StoragePayload::Entity).map_err(|e| StorageFailure {
            entity: Some(entity),
            description: e.to_string(),
        })
    }

    fn find_by_guid_of(&self, query: &Entity) -> Option<&Entity> {
        let guid = query.guid()?;
        self.find_by_guid(query.kind(), guid)
    }

    fn find_by_name_of(&self, query: &Entity) -> Option<&Entity> {
        let key = query.display_key()?;
        self.find_by_name(query.kind(), key)
    }

    pub fn find_by_guid(&self, kind: EntityKind, guid: &Guid) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.kind() == kind && e.guid() == Some(guid))
    }

    pub fn find_by_name(&self, kind: EntityKind, name: &str) -> Option<&Entity> {
        let wanted = name.to_lowercase();
        self.entities.iter().find(|e| {
            e.kind() == kind
                && e.display_key()
                    .is_some_and(|key| key.to_lowercase() == wanted)
        })
    }

    pub fn get(&self, local_id: LocalId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.local_id() == local_id)
    }

    pub fn all(&self, kind: EntityKind) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn list(&self, kind: EntityKind, filter: ListFilter) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|e| e.kind() == kind && filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Insert a new entity.
    pub fn add(&mut self, entity: Entity) -> Result<Entity> {
        if self.get(entity.local_id()).is_some() {
            return Err(StorageError::AlreadyExists(entity.describe()));
        }
        self.check_guid_free(&entity)?;
        self.check_note_notebook(&entity)?;
        self.entities.push(entity.clone());
        Ok(entity)
    }

    /// Replace the stored entity with the same local id.
    pub fn update(&mut self, entity: Entity) -> Result<Entity> {
        let index = self
            .entities
            .iter()
            .position(|e| e.local_id() == entity.local_id())
            .ok_or_else(|| StorageError::NotFound(entity.describe()))?;
        if self.entities[index].kind() != entity.kind() {
            return Err(StorageError::KindMismatch(entity.describe()));
        }
        self.check_guid_free(&entity)?;
        self.check_note_notebook(&entity)?;
        self.entities[index] = entity.clone();
        Ok(entity)
    }

    /// Remove the entity of `kind` with `guid`. Expunging a notebook removes
    /// its notes; expunging a note removes its resources.
    pub fn expunge(&mut self, kind: EntityKind, guid: &Guid) -> Result<()> {
        let target = self
            .find_by_guid(kind, guid)
            .map(|e| e.local_id())
            .ok_or_else(|| StorageError::NotFound(format!("{} with guid {}", kind, guid)))?;

        self.entities.retain(|e| e.local_id() != target);
        match kind {
            EntityKind::Notebook => {
                let orphaned: Vec<LocalId> = self
                    .entities
                    .iter()
                    .filter_map(|e| e.as_note())
                    .filter(|n| n.notebook_local_id == Some(target))
                    .map(|n| n.local_id)
                    .collect();
                self.entities.retain(|e| !orphaned.contains(&e.local_id()));
            }
            EntityKind::Note => {
                self.entities.retain(|e| match e {
                    Entity::Resource(resource) => {
                        resource.note_local_id != Some(target)
                            && resource.note_guid.as_ref() != Some(guid)
                    }
                    _ => true,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn check_guid_free(&self, entity: &Entity) -> Result<()> {
        let Some(guid) = entity.guid() else {
            return Ok(());
        };
        match self.find_by_guid(entity.kind(), guid) {
            Some(existing) if existing.local_id() != entity.local_id() => {
                Err(StorageError::GuidInUse {
                    kind: entity.kind(),
                    guid: guid.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn check_note_notebook(&self, entity: &Entity) -> Result<()> {
        let Some(note) = entity.as_note() else {
            return Ok(());
        };
        let known = note.notebook_local_id.is_some_and(|id| {
            self.get(id)
                .is_some_and(|e| e.kind() == EntityKind::Notebook)
        });
        if known {
            Ok(())
        } else {
            Err(StorageError::MissingNotebook {
                note: entity.describe(),
            })
        }
    }
}
