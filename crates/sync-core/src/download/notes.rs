//! Notes and resources: parent lookup before any write, and for notes a full
//! body fetch since sync chunks omit content.

use super::run_state::{MergeJob, RemoteStep, StorageStep, TimerPurpose};
use super::DownloadOrchestrator;
use crate::action::{NoteFetchOptions, RemotePayload, RemoteRequest};
use crate::entity::{Entity, EntityKind, SyncEntity};
use crate::events::SyncEvent;
use crate::fault::{ErrorKind, RemoteError};
use crate::storage::{StorageFailure, StorageOp, StoragePayload};
use crate::types::Note;
use tracing::{debug, warn};

impl DownloadOrchestrator {
    /// Look up the notebook of a note, or the note of a resource.
    pub(super) fn resolve_parent(&mut self, job: MergeJob) {
        let lookup = match job.resolution.target() {
            Some(Entity::Note(note)) => match &note.notebook_guid {
                Some(notebook_guid) => {
                    Entity::with_guid(EntityKind::Notebook, notebook_guid.clone())
                }
                None => {
                    let description =
                        format!("Note \"{}\" ({}) has no notebook guid", note.title, job.guid);
                    self.fail_internal(description);
                    return;
                }
            },
            Some(Entity::Resource(resource)) => match &resource.note_guid {
                Some(note_guid) => Entity::with_guid(EntityKind::Note, note_guid.clone()),
                None => {
                    warn!(resource = %job.guid, "skipping resource without a note guid");
                    return;
                }
            },
            _ => {
                self.apply(job.resolution);
                return;
            }
        };
        self.storage(StorageOp::FindByGuid(lookup), StorageStep::Parent(job));
    }

    pub(super) fn on_parent(
        &mut self,
        mut job: MergeJob,
        result: Result<StoragePayload, StorageFailure>,
    ) {
        let parent = match result {
            Ok(StoragePayload::Entity(parent)) => Some(parent.local_id()),
            _ => None,
        };

        let is_note = match job.resolution.target_mut() {
            Some(Entity::Note(note)) => {
                let Some(notebook_id) = parent else {
                    let description = format!(
                        "Note \"{}\" ({}) references notebook {} which is not in local storage",
                        note.title,
                        job.guid,
                        note.notebook_guid.as_ref().map(|g| g.as_str()).unwrap_or("?")
                    );
                    self.fail_internal(description);
                    return;
                };
                note.notebook_local_id = Some(notebook_id);
                true
            }
            Some(Entity::Resource(resource)) => {
                let Some(note_id) = parent else {
                    warn!(
                        resource = %job.guid,
                        note = ?resource.note_guid,
                        "skipping resource whose note is not in local storage"
                    );
                    return;
                };
                resource.note_local_id = Some(note_id);
                false
            }
            _ => false,
        };

        if is_note {
            if let Some(notebook_id) = parent {
                self.run.note_notebooks.insert(job.guid.clone(), notebook_id);
            }
            self.fetch_full_note(job);
        } else {
            self.apply(job.resolution);
        }
    }

    /// Request the note body, or park the job while paused.
    pub(super) fn fetch_full_note(&mut self, job: MergeJob) {
        if self.paused {
            self.run.awaiting_fetch.push(job);
            return;
        }
        if self.stopping {
            return;
        }
        let options = NoteFetchOptions {
            with_content: true,
            with_resources_data: self.config.fetch_resource_data,
            with_resources_recognition: self.config.fetch_resource_recognition,
            with_resources_alternate_data: self.config.fetch_resource_alternate_data,
        };
        let request = RemoteRequest::FullNote {
            guid: job.guid.clone(),
            options,
        };
        self.remote(request, RemoteStep::FullNote(job));
    }

    pub(super) fn on_full_note(
        &mut self,
        mut job: MergeJob,
        result: Result<RemotePayload, RemoteError>,
    ) {
        match result {
            Ok(RemotePayload::Note(full)) => {
                if let Some(Entity::Note(target)) = job.resolution.target_mut() {
                    absorb_full_note(target, full);
                }
                debug!(note = %job.guid, "full note downloaded");
                self.apply(job.resolution);
            }
            Ok(RemotePayload::SyncChunk(_)) => {
                self.fail_internal(format!(
                    "Failed to download full note {}: received a sync chunk instead",
                    job.guid
                ));
            }
            Err(err) => match err.kind {
                ErrorKind::RateLimitReached => match err.retry_after {
                    Some(delay) => {
                        warn!(
                            note = %job.guid,
                            seconds = delay.as_secs(),
                            "rate limited, retrying full note later"
                        );
                        self.arm_timer(delay, TimerPurpose::RefetchNote(job));
                        self.emit(SyncEvent::RateLimitExceeded {
                            seconds: delay.as_secs(),
                        });
                    }
                    None => self.fail_internal(err.description),
                },
                ErrorKind::AuthExpired => {
                    self.run.awaiting_fetch.push(job);
                    self.pause_for_authentication();
                }
                _ => self.fail_remote(err),
            },
        }
    }
}

/// Take the fetched body while keeping what was resolved locally.
fn absorb_full_note(target: &mut Note, full: Note) {
    let local_id = target.local_id;
    let notebook_local_id = target.notebook_local_id;
    *target = Note {
        local_id,
        notebook_local_id,
        dirty: false,
        local: false,
        ..full
    };
    for resource in &mut target.resources {
        resource.note_local_id = Some(local_id);
        resource.dirty = false;
        resource.local = false;
    }
}
