//! Shared (linked) notebooks: each has its own change feed, paged with its
//! own token once the account's content is merged.

use super::run_state::{Cursor, LinkedScope, StorageStep};
use super::{DownloadOrchestrator, LinkedNotebookAuth, SyncState};
use crate::entity::{EntityKind, SyncEntity};
use crate::events::{LinkedNotebookRef, SyncEvent};
use crate::storage::{StorageFailure, StorageOp, StoragePayload};
use crate::types::{Guid, Timestamp};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

impl DownloadOrchestrator {
    pub(super) fn start_linked_phase(&mut self) {
        self.enter(SyncState::DownloadingLinkedNotebookChunks);
        self.storage(
            StorageOp::ListAll {
                kind: EntityKind::LinkedNotebook,
            },
            StorageStep::ListLinkedNotebooks,
        );
    }

    pub(super) fn on_linked_notebooks_listed(
        &mut self,
        result: Result<StoragePayload, StorageFailure>,
    ) {
        let entities = match result {
            Ok(StoragePayload::Entities(entities)) => entities,
            Ok(_) => {
                self.fail_internal(
                    "Local storage answered the linked notebook listing with a single entity"
                        .to_string(),
                );
                return;
            }
            Err(failure) => {
                self.fail(format!(
                    "Failed to list linked notebooks in local storage: {}",
                    failure.description
                ));
                return;
            }
        };

        for notebook in entities.into_iter().filter_map(|e| e.into_linked_notebook()) {
            let Some(guid) = notebook.guid().cloned() else {
                warn!(name = %notebook.share_name, "skipping linked notebook without a guid");
                continue;
            };
            let after_usn = self.run.checkpoint.linked_after_usn.get(&guid).copied().unwrap_or(0);
            self.run.linked.insert(
                guid,
                LinkedScope {
                    notebook,
                    cursor: Cursor::new(after_usn),
                },
            );
        }

        if self.run.linked.is_empty() {
            debug!("no linked notebooks to download");
            self.finalize();
            return;
        }
        info!(count = self.run.linked.len(), "downloading linked notebooks");
        self.start_linked_downloads();
    }

    /// Page every linked feed, or ask for tokens first if any is missing or
    /// expired.
    pub(super) fn start_linked_downloads(&mut self) {
        let lacking = lacking_tokens(&self.run.linked, &self.linked_tokens, self.clock.now_ms());
        if !lacking.is_empty() {
            self.request_linked_tokens();
            return;
        }
        self.restart_idle_cursors();
        self.check_downloads_complete();
    }

    /// Once any pending feed lacks a token, ask once for tokens for every
    /// pending feed.
    pub(super) fn request_linked_tokens(&mut self) {
        if self.run.awaiting_linked_tokens {
            return;
        }
        let lacking = lacking_tokens(&self.run.linked, &self.linked_tokens, self.clock.now_ms());
        if lacking.is_empty() {
            return;
        }
        let notebooks = pending_feeds(&self.run.linked);
        debug!(
            lacking = lacking.len(),
            count = notebooks.len(),
            "requesting linked notebook tokens"
        );
        self.run.awaiting_linked_tokens = true;
        self.emit(SyncEvent::RequestLinkedNotebookTokens { notebooks });
    }
}

/// Linked notebooks whose feed has not reached its head.
fn pending_feeds(linked: &BTreeMap<Guid, LinkedScope>) -> Vec<LinkedNotebookRef> {
    linked
        .iter()
        .filter(|(_, scope)| !scope.cursor.done)
        .map(|(guid, scope)| LinkedNotebookRef {
            guid: guid.clone(),
            shared_notebook_global_id: scope.notebook.shared_notebook_global_id.clone(),
        })
        .collect()
}

/// Linked notebooks without a cached token valid at `now_ms`.
fn lacking_tokens(
    linked: &BTreeMap<Guid, LinkedScope>,
    tokens: &HashMap<Guid, LinkedNotebookAuth>,
    now_ms: Timestamp,
) -> Vec<LinkedNotebookRef> {
    linked
        .iter()
        .filter(|(guid, scope)| {
            !scope.cursor.done && !tokens.get(*guid).is_some_and(|auth| auth.is_valid_at(now_ms))
        })
        .map(|(guid, scope)| LinkedNotebookRef {
            guid: guid.clone(),
            shared_notebook_global_id: scope.notebook.shared_notebook_global_id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LinkedNotebook;

    fn scope(global_id: &str) -> LinkedScope {
        LinkedScope {
            notebook: LinkedNotebook {
                share_name: global_id.into(),
                shared_notebook_global_id: Some(global_id.into()),
                ..Default::default()
            },
            cursor: Cursor::new(0),
        }
    }

    #[test]
    fn test_lacking_tokens_skips_valid_ones() {
        let fresh = Guid::generate();
        let stale = Guid::generate();
        let missing = Guid::generate();
        let linked = BTreeMap::from([
            (fresh.clone(), scope("fresh")),
            (stale.clone(), scope("stale")),
            (missing.clone(), scope("missing")),
        ]);
        let tokens = HashMap::from([
            (
                fresh,
                LinkedNotebookAuth {
                    token: "a".into(),
                    expires_ms: None,
                },
            ),
            (
                stale.clone(),
                LinkedNotebookAuth {
                    token: "b".into(),
                    expires_ms: Some(500),
                },
            ),
        ]);

        let mut lacking: Vec<Guid> = lacking_tokens(&linked, &tokens, 1_000)
            .into_iter()
            .map(|r| r.guid)
            .collect();
        lacking.sort();
        let mut expected = vec![stale, missing];
        expected.sort();
        assert_eq!(lacking, expected);
    }

    #[test]
    fn test_finished_feeds_need_no_token() {
        let guid = Guid::generate();
        let mut done = scope("done");
        done.cursor.done = true;
        let linked = BTreeMap::from([(guid, done)]);
        assert!(lacking_tokens(&linked, &HashMap::new(), 0).is_empty());
        assert!(pending_feeds(&linked).is_empty());
    }
}
