//! Notifications published to the controller layer and the bus that fans
//! them out.

use crate::types::{Guid, Timestamp, Usn};
use crate::upload::LocalChanges;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Where a linked notebook's own change feed ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedSyncProgress {
    pub update_count: Usn,
    pub sync_time: Timestamp,
}

/// Linked notebook that needs an authentication token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedNotebookRef {
    pub guid: Guid,
    pub shared_notebook_global_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The run aborted; no further progress will be made.
    Failure { description: String },
    /// The run completed. Carries the new checkpoint.
    #[serde(rename_all = "camelCase")]
    Finished {
        last_update_count: Usn,
        last_sync_time: Timestamp,
        linked_notebooks: BTreeMap<Guid, LinkedSyncProgress>,
    },
    /// A timer has been armed to retry after `seconds`.
    RateLimitExceeded { seconds: u64 },
    /// All account sync chunks are in memory.
    SyncChunksDownloaded,
    /// Every note addition or update of the current phase reached storage.
    FullNotesContentsDownloaded,
    LinkedNotebooksSyncChunksDownloaded,
    #[serde(rename_all = "camelCase")]
    Paused { pending_authentication: bool },
    Stopped,
    RequestAuthenticationToken,
    /// One batched request for every linked notebook lacking a valid token.
    RequestLinkedNotebookTokens { notebooks: Vec<LinkedNotebookRef> },
    LocalChangesCollected { changes: LocalChanges },
}

impl SyncEvent {
    /// Events after which the emitting state machine is idle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncEvent::Failure { .. } | SyncEvent::Finished { .. } | SyncEvent::Stopped
        )
    }
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Subscription handle; dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Fans [`SyncEvent`]s out to subscribers. Wrap in `Arc` to subscribe.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: a subscription dropped from inside a callback must not deadlock.
        if let Ok(mut subscribers) = self.subscribers.try_write() {
            subscribers.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn emit(&self, event: &SyncEvent) {
        // Snapshot so callbacks may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(bus: &Arc<EventBus>) -> (Subscription, Arc<Mutex<Vec<SyncEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        (sub, seen)
    }

    #[test]
    fn test_subscribers_receive_events() {
        let bus = Arc::new(EventBus::new());
        let (_sub_a, seen_a) = recorder(&bus);
        let (_sub_b, seen_b) = recorder(&bus);

        bus.emit(&SyncEvent::SyncChunksDownloaded);

        assert_eq!(*seen_a.lock().unwrap(), vec![SyncEvent::SyncChunksDownloaded]);
        assert_eq!(seen_b.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dropping_subscription_stops_delivery() {
        let bus = Arc::new(EventBus::new());
        let (sub, seen) = recorder(&bus);

        bus.emit(&SyncEvent::Stopped);
        drop(sub);
        bus.emit(&SyncEvent::Stopped);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_terminal_events() {
        assert!(SyncEvent::Stopped.is_terminal());
        assert!(
            SyncEvent::Failure {
                description: "x".into()
            }
            .is_terminal()
        );
        assert!(!SyncEvent::RateLimitExceeded { seconds: 30 }.is_terminal());
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::Paused {
            pending_authentication: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"paused\""));
        assert!(json.contains("\"pendingAuthentication\":true"));

        let finished = SyncEvent::Finished {
            last_update_count: 7,
            last_sync_time: 1000,
            linked_notebooks: BTreeMap::new(),
        };
        let json = serde_json::to_string(&finished).unwrap();
        assert!(json.contains("\"lastUpdateCount\":7"));
    }
}
