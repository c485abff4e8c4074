//! Collection half of the local change uploader.
//!
//! `start` asks local storage for every dirty or never-synced tag, saved
//! search, notebook, note and linked notebook. Once all five listings are in,
//! the collected changes are published with `LocalChangesCollected`. Pushing
//! them to the remote service is left to the caller.

use crate::action::SyncAction;
use crate::entity::{Entity, EntityKind};
use crate::events::SyncEvent;
use crate::storage::{ListFilter, StorageOp, StoragePayload, StorageRequest, StorageResponse};
use crate::types::RequestId;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Kinds listed by the uploader, in upload order.
const COLLECTED_KINDS: [EntityKind; 5] = [
    EntityKind::Tag,
    EntityKind::SavedSearch,
    EntityKind::Notebook,
    EntityKind::Note,
    EntityKind::LinkedNotebook,
];

/// Local entities with edits the remote service has not seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChanges {
    pub tags: Vec<Entity>,
    pub searches: Vec<Entity>,
    pub notebooks: Vec<Entity>,
    pub notes: Vec<Entity>,
    pub linked_notebooks: Vec<Entity>,
}

impl LocalChanges {
    fn slot(&mut self, kind: EntityKind) -> Option<&mut Vec<Entity>> {
        match kind {
            EntityKind::Tag => Some(&mut self.tags),
            EntityKind::SavedSearch => Some(&mut self.searches),
            EntityKind::Notebook => Some(&mut self.notebooks),
            EntityKind::Note => Some(&mut self.notes),
            EntityKind::LinkedNotebook => Some(&mut self.linked_notebooks),
            EntityKind::Resource => None,
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
            + self.searches.len()
            + self.notebooks.len()
            + self.notes.len()
            + self.linked_notebooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct LocalChangeUploader {
    pending: HashMap<RequestId, EntityKind>,
    collected: LocalChanges,
    active: bool,
    outbox: Vec<SyncAction>,
}

impl LocalChangeUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Issue the five listing requests. Restarts collection if one is running.
    pub fn start(&mut self) -> Vec<SyncAction> {
        if self.active {
            warn!("restarting local change collection");
        }
        self.reset();
        self.active = true;
        for kind in COLLECTED_KINDS {
            let request = StorageRequest::new(StorageOp::ListDirtyOrNew {
                kind,
                filter: ListFilter::dirty_or_new(),
            });
            self.pending.insert(request.id, kind);
            self.outbox.push(SyncAction::Storage(request));
        }
        debug!(requests = self.pending.len(), "collecting local changes");
        std::mem::take(&mut self.outbox)
    }

    pub fn on_storage_response(&mut self, response: StorageResponse) -> Vec<SyncAction> {
        let Some(kind) = self.pending.remove(&response.id) else {
            debug!(request = %response.id, "ignoring reply to unknown listing request");
            return std::mem::take(&mut self.outbox);
        };

        match response.result {
            Ok(StoragePayload::Entities(entities)) => {
                debug!(%kind, count = entities.len(), "listed local changes");
                if let Some(slot) = self.collected.slot(kind) {
                    slot.extend(entities);
                }
                self.check_list_completion();
            }
            Ok(_) => self.fail(format!(
                "Local storage answered the {} listing with a single entity",
                kind
            )),
            Err(failure) => self.fail(format!(
                "Failed to list new or modified {} items in local storage: {}",
                kind, failure.description
            )),
        }
        std::mem::take(&mut self.outbox)
    }

    /// Drop the collection in progress; late replies are ignored.
    pub fn clear(&mut self) {
        self.reset();
    }

    fn check_list_completion(&mut self) {
        if !self.active || !self.pending.is_empty() {
            return;
        }
        let changes = std::mem::take(&mut self.collected);
        info!(count = changes.len(), "local changes collected");
        self.outbox.push(SyncAction::Notify(SyncEvent::LocalChangesCollected { changes }));
        self.reset();
    }

    fn fail(&mut self, description: String) {
        error!("{}", description);
        self.outbox.push(SyncAction::Notify(SyncEvent::Failure { description }));
        self.reset();
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.collected = LocalChanges::default();
        self.active = false;
    }
}
