use super::*;
use crate::entity::EntityKind;
use crate::events::LinkedNotebookRef;
use crate::fault::{ErrorCode, Operation, RemoteFault};
use crate::remote::{InMemoryNoteService, RemoteNoteClient};
use crate::storage::InMemoryStorage;
use crate::types::{FixedClock, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Tag};
use std::collections::VecDeque;

const NOW: Timestamp = 1_700_000_000_000;

/// Executes orchestrator actions against in-memory storage and service,
/// recording everything that was dispatched.
struct Harness {
    orchestrator: DownloadOrchestrator,
    storage: InMemoryStorage,
    client: RemoteNoteClient<InMemoryNoteService>,
    storage_log: Vec<StorageOp>,
    remote_log: Vec<RemoteRequest>,
    events: Vec<SyncEvent>,
    timers: Vec<(TimerId, Duration)>,
    storage_queue: VecDeque<StorageRequest>,
    remote_queue: VecDeque<RemoteCall>,
}

impl Harness {
    fn new(service: InMemoryNoteService) -> Self {
        Self::with_config(service, SyncConfig::default())
    }

    fn with_config(service: InMemoryNoteService, config: SyncConfig) -> Self {
        Self {
            orchestrator: DownloadOrchestrator::with_clock(config, FixedClock(NOW)).unwrap(),
            storage: InMemoryStorage::new(),
            client: RemoteNoteClient::new(service, "token"),
            storage_log: Vec::new(),
            remote_log: Vec::new(),
            events: Vec::new(),
            timers: Vec::new(),
            storage_queue: VecDeque::new(),
            remote_queue: VecDeque::new(),
        }
    }

    fn service(&self) -> &InMemoryNoteService {
        self.client.service()
    }

    fn absorb(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::Storage(request) => {
                    self.storage_log.push(request.op.clone());
                    self.storage_queue.push_back(request);
                }
                SyncAction::Remote(call) => {
                    self.remote_log.push(call.request.clone());
                    self.remote_queue.push_back(call);
                }
                SyncAction::ArmTimer { id, delay } => self.timers.push((id, delay)),
                SyncAction::CancelTimer(id) => self.timers.retain(|(t, _)| *t != id),
                SyncAction::Notify(event) => self.events.push(event),
            }
        }
    }

    /// Answer queued requests until nothing is left to answer.
    async fn run(&mut self) {
        loop {
            if let Some(request) = self.storage_queue.pop_front() {
                let response = self.storage.handle(request);
                let actions = self.orchestrator.on_storage_response(response);
                self.absorb(actions);
            } else if let Some(call) = self.remote_queue.pop_front() {
                let response = self.client.execute(call).await;
                let actions = self.orchestrator.on_remote_response(response);
                self.absorb(actions);
            } else {
                break;
            }
        }
    }

    async fn pull(&mut self, after_usn: Usn) {
        let actions = self.orchestrator.start(after_usn);
        self.absorb(actions);
        self.run().await;
    }

    async fn fire_timers(&mut self) {
        for (id, _) in std::mem::take(&mut self.timers) {
            let actions = self.orchestrator.on_timer(id);
            self.absorb(actions);
        }
        self.run().await;
    }

    fn finished(&self) -> Option<&SyncEvent> {
        self.events.iter().find(|e| matches!(e, SyncEvent::Finished { .. }))
    }

    fn failure(&self) -> Option<&str> {
        self.events.iter().find_map(|e| match e {
            SyncEvent::Failure { description } => Some(description.as_str()),
            _ => None,
        })
    }

    fn writes_since(&self, from: usize) -> Vec<&StorageOp> {
        self.storage_log[from..]
            .iter()
            .filter(|op| matches!(op, StorageOp::Add(_) | StorageOp::Update(_)))
            .collect()
    }
}

fn tag(name: &str) -> Tag {
    Tag {
        name: name.into(),
        ..Default::default()
    }
}

fn guid_of(entity: &Entity) -> Guid {
    entity.guid().cloned().unwrap()
}

fn rate_limit(seconds: i32) -> RemoteFault {
    RemoteFault::System {
        code: ErrorCode::RateLimitReached,
        message: None,
        rate_limit_duration: Some(seconds),
    }
}

/// Account with one notebook holding one note with an attached resource.
fn account() -> (InMemoryNoteService, Guid, Guid) {
    let service = InMemoryNoteService::new();
    service.set_current_time(NOW);
    let notebook = service.put(Notebook {
        name: "Inbox".into(),
        ..Default::default()
    });
    service.put(tag("Work"));
    service.put(SavedSearch {
        name: "Todo".into(),
        query: Some("todo:*".into()),
        ..Default::default()
    });
    let note = service.put(Note {
        title: "Groceries".into(),
        content: Some("<en-note>milk</en-note>".into()),
        notebook_guid: Some(guid_of(&notebook)),
        ..Default::default()
    });
    service.put(Resource {
        note_guid: Some(guid_of(&note)),
        mime: Some("image/png".into()),
        data: Some(vec![1, 2, 3]),
        ..Default::default()
    });
    (service, guid_of(&notebook), guid_of(&note))
}

#[tokio::test]
async fn test_full_pull_populates_storage() {
    let (service, notebook_guid, note_guid) = account();
    let mut h = Harness::new(service);

    h.pull(0).await;

    assert!(h.failure().is_none(), "{:?}", h.events);
    let notebook = h.storage.find_by_guid(EntityKind::Notebook, &notebook_guid).unwrap().clone();
    let note = h
        .storage
        .find_by_guid(EntityKind::Note, &note_guid)
        .unwrap()
        .as_note()
        .unwrap()
        .clone();
    assert_eq!(note.notebook_local_id, Some(notebook.local_id()));
    assert_eq!(note.content.as_deref(), Some("<en-note>milk</en-note>"));
    assert!(!note.is_dirty());
    assert_eq!(h.storage.all(EntityKind::Tag).len(), 1);
    assert_eq!(h.storage.all(EntityKind::SavedSearch).len(), 1);
    match h.storage.all(EntityKind::Resource).as_slice() {
        [Entity::Resource(resource)] => assert_eq!(resource.note_local_id, Some(note.local_id)),
        other => panic!("unexpected resources {:?}", other),
    }

    assert_eq!(h.events.first(), Some(&SyncEvent::SyncChunksDownloaded));
    assert!(h.events.contains(&SyncEvent::FullNotesContentsDownloaded));
    assert_eq!(
        h.finished(),
        Some(&SyncEvent::Finished {
            last_update_count: h.service().update_count(),
            last_sync_time: NOW,
            linked_notebooks: BTreeMap::new(),
        })
    );
    assert_eq!(h.orchestrator.state(), SyncState::Idle);
    assert_eq!(h.orchestrator.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_pages_until_head() {
    let service = InMemoryNoteService::new();
    for name in ["a", "b", "c", "d", "e"] {
        service.put(tag(name));
    }
    let config = SyncConfig {
        max_entries_per_chunk: 2,
        ..Default::default()
    };
    let mut h = Harness::with_config(service, config);

    h.pull(0).await;

    let pages: Vec<Usn> = h
        .remote_log
        .iter()
        .filter_map(|r| match r {
            RemoteRequest::SyncChunk { after_usn, .. } => Some(*after_usn),
            _ => None,
        })
        .collect();
    assert_eq!(pages, vec![0, 2, 4]);
    assert_eq!(h.storage.all(EntityKind::Tag).len(), 5);
    assert!(h.finished().is_some());
}

#[tokio::test]
async fn test_second_pull_writes_nothing() {
    let (service, _, _) = account();
    let mut h = Harness::new(service);
    h.pull(0).await;
    assert!(h.finished().is_some());

    let mark = h.storage_log.len();
    h.events.clear();
    h.pull(0).await;

    assert!(h.finished().is_some(), "{:?}", h.events);
    assert!(h.writes_since(mark).is_empty(), "{:?}", h.writes_since(mark));
}

#[tokio::test]
async fn test_guid_match_wins_over_name_match() {
    let service = InMemoryNoteService::new();
    service.put(tag("filler"));
    let guid = Guid::generate();
    service.put(Tag {
        guid: Some(guid.clone()),
        name: "Beta".into(),
        ..Default::default()
    });

    let mut h = Harness::new(service);
    let by_guid = h
        .storage
        .add(
            Tag {
                guid: Some(guid.clone()),
                usn: Some(1),
                name: "Alpha".into(),
                ..Default::default()
            }
            .into(),
        )
        .unwrap();
    let by_name = h
        .storage
        .add(
            Tag {
                name: "beta".into(),
                dirty: true,
                local: true,
                ..Default::default()
            }
            .into(),
        )
        .unwrap();

    h.pull(0).await;

    assert!(h.finished().is_some(), "{:?}", h.events);
    let updated = h.storage.get(by_guid.local_id()).unwrap();
    assert_eq!(updated.display_key(), Some("Beta"));
    assert_eq!(updated.guid(), Some(&guid));
    assert_eq!(h.storage.get(by_name.local_id()), Some(&by_name));
    assert!(!h.storage_log.iter().any(|op| matches!(
        op,
        StorageOp::FindByName(query) if query.guid() == Some(&guid)
    )));
}

#[tokio::test]
async fn test_dirty_local_tag_is_renamed_as_conflict() {
    let service = InMemoryNoteService::new();
    for filler in ["f1", "f2", "f3", "f4"] {
        service.put(tag(filler));
    }
    let remote = service.put(tag("Work"));
    let remote_guid = guid_of(&remote);
    assert_eq!(remote.usn(), Some(5));

    let mut h = Harness::new(service);
    let local = h
        .storage
        .add(
            Tag {
                usn: Some(3),
                name: "Work".into(),
                dirty: true,
                ..Default::default()
            }
            .into(),
        )
        .unwrap();

    h.pull(0).await;

    assert!(h.finished().is_some(), "{:?}", h.events);
    let renamed = h.storage.get(local.local_id()).unwrap();
    assert!(renamed.is_dirty());
    assert!(renamed.guid().is_none());
    assert_eq!(renamed.display_key(), Some("Conflicted Tag Work (2023-11-14 22:13:20)"));

    let added = h.storage.find_by_guid(EntityKind::Tag, &remote_guid).unwrap();
    assert_ne!(added.local_id(), local.local_id());
    assert_eq!(added.display_key(), Some("Work"));
    assert!(!added.is_dirty());
}

#[tokio::test]
async fn test_name_match_is_claimed_by_one_remote_entity() {
    let service = InMemoryNoteService::new();
    service.set_current_time(NOW);
    let notebook = service.put(Notebook {
        name: "Inbox".into(),
        ..Default::default()
    });
    let mut remote_guids = Vec::new();
    for body in ["first", "second"] {
        let note = service.put(Note {
            title: "Untitled".into(),
            content: Some(format!("<en-note>{body}</en-note>")),
            notebook_guid: Some(guid_of(&notebook)),
            ..Default::default()
        });
        remote_guids.push(guid_of(&note));
    }

    let mut h = Harness::new(service);
    let local = h
        .storage
        .add(
            Note {
                title: "Untitled".into(),
                ..Default::default()
            }
            .into(),
        )
        .unwrap();

    h.pull(0).await;

    assert!(h.failure().is_none(), "{:?}", h.events);
    assert!(h.finished().is_some(), "{:?}", h.events);
    assert_eq!(h.storage.all(EntityKind::Note).len(), 2);
    let stored: Vec<LocalId> = remote_guids
        .iter()
        .map(|guid| h.storage.find_by_guid(EntityKind::Note, guid).unwrap().local_id())
        .collect();
    assert!(stored.contains(&local.local_id()));
    assert_ne!(stored[0], stored[1]);
}

#[tokio::test]
async fn test_unsent_local_note_survives_name_match() {
    let service = InMemoryNoteService::new();
    service.set_current_time(NOW);
    let notebook = service.put(Notebook {
        name: "Inbox".into(),
        ..Default::default()
    });
    let remote = service.put(Note {
        title: "Plan".into(),
        content: Some("<en-note>remote</en-note>".into()),
        notebook_guid: Some(guid_of(&notebook)),
        ..Default::default()
    });

    let mut h = Harness::new(service);
    let local = h
        .storage
        .add(
            Note {
                title: "Plan".into(),
                content: Some("<en-note>draft</en-note>".into()),
                local: true,
                ..Default::default()
            }
            .into(),
        )
        .unwrap();

    h.pull(0).await;

    assert!(h.finished().is_some(), "{:?}", h.events);
    let kept = h.storage.get(local.local_id()).unwrap().as_note().unwrap();
    assert_eq!(kept.content.as_deref(), Some("<en-note>draft</en-note>"));
    assert!(kept.guid.is_none());
    assert!(kept.title.starts_with("Conflicted Note Plan ("), "{}", kept.title);
    let added = h.storage.find_by_guid(EntityKind::Note, &guid_of(&remote)).unwrap();
    assert_eq!(added.as_note().unwrap().content.as_deref(), Some("<en-note>remote</en-note>"));
}

#[tokio::test]
async fn test_clean_notebook_is_updated_once_in_place() {
    let service = InMemoryNoteService::new();
    for filler in ["f1", "f2", "f3", "f4", "f5", "f6"] {
        service.put(tag(filler));
    }
    let guid = Guid::generate();
    let remote = service.put(Notebook {
        guid: Some(guid.clone()),
        name: "New".into(),
        stack: Some("Projects".into()),
        ..Default::default()
    });
    assert_eq!(remote.usn(), Some(7));

    let mut h = Harness::new(service);
    let local = h
        .storage
        .add(
            Notebook {
                guid: Some(guid.clone()),
                usn: Some(3),
                name: "Old".into(),
                ..Default::default()
            }
            .into(),
        )
        .unwrap();

    h.pull(0).await;

    let updates: Vec<&Entity> = h
        .storage_log
        .iter()
        .filter_map(|op| match op {
            StorageOp::Update(entity) if entity.kind() == EntityKind::Notebook => Some(entity),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    let notebook = updates[0].as_notebook().unwrap();
    assert_eq!(notebook.local_id, local.local_id());
    assert_eq!(notebook.name, "New");
    assert_eq!(notebook.stack.as_deref(), Some("Projects"));
    assert_eq!(notebook.usn, Some(7));
    assert!(!h.storage_log.iter().any(|op| matches!(
        op,
        StorageOp::Add(entity) if entity.kind() == EntityKind::Notebook
    )));
}

#[tokio::test]
async fn test_rate_limit_arms_one_timer() {
    let (service, _, _) = account();
    service.fail_next(Operation::GetSyncChunk, rate_limit(30));
    let mut h = Harness::new(service);

    h.pull(0).await;

    assert_eq!(h.timers.len(), 1);
    assert_eq!(h.timers[0].1, Duration::from_secs(30));
    assert_eq!(h.events, vec![SyncEvent::RateLimitExceeded { seconds: 30 }]);
    assert_eq!(h.service().call_count(Operation::GetSyncChunk), 1);
    assert!(h.orchestrator.is_active());

    h.fire_timers().await;

    assert_eq!(h.service().call_count(Operation::GetSyncChunk), 2);
    assert!(h.finished().is_some(), "{:?}", h.events);
}

#[tokio::test]
async fn test_pause_during_rate_limit_keeps_waiting() {
    let (service, _, _) = account();
    service.fail_next(Operation::GetSyncChunk, rate_limit(30));
    let mut h = Harness::new(service);
    h.pull(0).await;
    assert_eq!(h.timers.len(), 1);

    let actions = h.orchestrator.pause();
    h.absorb(actions);
    let actions = h.orchestrator.resume();
    h.absorb(actions);
    h.run().await;

    assert_eq!(h.timers.len(), 1, "timer survives the pause");
    assert_eq!(h.service().call_count(Operation::GetSyncChunk), 1);
    assert!(h.finished().is_none());

    h.fire_timers().await;

    assert_eq!(h.service().call_count(Operation::GetSyncChunk), 2);
    assert!(h.finished().is_some(), "{:?}", h.events);
}

#[tokio::test]
async fn test_refetch_timer_firing_while_paused_waits_for_resume() {
    let (service, _, note_guid) = account();
    service.fail_next(Operation::GetFullNote, rate_limit(10));
    let mut h = Harness::new(service);
    h.pull(0).await;
    assert_eq!(h.timers.len(), 1);

    let actions = h.orchestrator.pause();
    h.absorb(actions);
    h.fire_timers().await;

    assert_eq!(h.service().call_count(Operation::GetFullNote), 1);
    assert!(h.finished().is_none());

    let actions = h.orchestrator.resume();
    h.absorb(actions);
    h.run().await;

    assert_eq!(h.service().call_count(Operation::GetFullNote), 2);
    assert!(h.storage.find_by_guid(EntityKind::Note, &note_guid).is_some());
    assert!(h.finished().is_some(), "{:?}", h.events);
}

#[tokio::test]
async fn test_zero_rate_limit_duration_is_fatal() {
    let (service, _, _) = account();
    service.fail_next(Operation::GetSyncChunk, rate_limit(0));
    let mut h = Harness::new(service);

    h.pull(0).await;

    assert!(h.timers.is_empty());
    assert!(h.failure().is_some());
    assert_eq!(h.service().call_count(Operation::GetSyncChunk), 1);
    assert_eq!(h.orchestrator.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_full_note_rate_limit_refetches_that_note() {
    let (service, _, note_guid) = account();
    service.fail_next(Operation::GetFullNote, rate_limit(10));
    let mut h = Harness::new(service);

    h.pull(0).await;

    assert_eq!(h.timers.len(), 1);
    assert!(h.finished().is_none());
    assert!(h.storage.find_by_guid(EntityKind::Note, &note_guid).is_none());

    h.fire_timers().await;

    assert!(h.finished().is_some(), "{:?}", h.events);
    assert_eq!(h.service().call_count(Operation::GetFullNote), 2);
    assert!(h.storage.find_by_guid(EntityKind::Note, &note_guid).is_some());
}

#[tokio::test]
async fn test_note_add_follows_notebook_lookup() {
    let (service, notebook_guid, note_guid) = account();
    let mut h = Harness::new(service);

    h.pull(0).await;

    let lookups: Vec<usize> = h
        .storage_log
        .iter()
        .enumerate()
        .filter(|(_, op)| match op {
            StorageOp::FindByGuid(Entity::Notebook(nb)) => nb.guid.as_ref() == Some(&notebook_guid),
            _ => false,
        })
        .map(|(i, _)| i)
        .collect();
    let add = h
        .storage_log
        .iter()
        .position(|op| {
            matches!(op, StorageOp::Add(Entity::Note(n)) if n.guid.as_ref() == Some(&note_guid))
        })
        .unwrap();

    // The first lookup merges the notebook itself, the last resolves the note's parent.
    assert!(lookups.len() >= 2);
    assert!(lookups[lookups.len() - 1] < add);
    assert!(h.orchestrator.notebook_of(&note_guid).is_none(), "cleared on finish");
}

#[tokio::test]
async fn test_note_without_local_notebook_is_fatal() {
    let service = InMemoryNoteService::new();
    service.put(Note {
        title: "Orphan".into(),
        notebook_guid: Some(Guid::generate()),
        ..Default::default()
    });
    let mut h = Harness::new(service);

    h.pull(0).await;

    let failure = h.failure().unwrap();
    assert!(failure.contains("not in local storage"), "{failure}");
    assert!(!h.storage_log.iter().any(|op| matches!(op, StorageOp::Add(Entity::Note(_)))));
    assert_eq!(h.service().call_count(Operation::GetFullNote), 0);
}

#[tokio::test]
async fn test_expired_auth_pauses_until_resumed() {
    let (service, _, _) = account();
    service.require_token("fresh");
    let mut h = Harness::new(service);
    h.client.set_auth_token("stale");

    h.pull(0).await;

    assert_eq!(
        h.events,
        vec![
            SyncEvent::Paused {
                pending_authentication: true
            },
            SyncEvent::RequestAuthenticationToken,
        ]
    );
    assert!(h.orchestrator.is_pending_authentication());

    h.client.set_auth_token("fresh");
    let actions = h.orchestrator.resume();
    h.absorb(actions);
    h.run().await;

    assert!(h.finished().is_some(), "{:?}", h.events);
    assert!(h.failure().is_none());
}

#[tokio::test]
async fn test_pause_queues_replies() {
    let (service, _, _) = account();
    let mut h = Harness::new(service);
    let actions = h.orchestrator.start(0);
    h.absorb(actions);

    let actions = h.orchestrator.pause();
    h.absorb(actions);
    h.run().await;

    assert!(h.orchestrator.is_paused());
    assert_eq!(h.remote_log.len(), 1, "no new work while paused");
    assert!(h.storage_log.is_empty());
    assert_eq!(
        h.events,
        vec![SyncEvent::Paused {
            pending_authentication: false
        }]
    );

    let actions = h.orchestrator.resume();
    h.absorb(actions);
    h.run().await;

    assert!(h.finished().is_some(), "{:?}", h.events);
}

#[tokio::test]
async fn test_stop_waits_for_outstanding_replies() {
    let (service, _, _) = account();
    let mut h = Harness::new(service);
    let actions = h.orchestrator.start(0);
    h.absorb(actions);

    let actions = h.orchestrator.stop();
    h.absorb(actions);
    assert!(h.events.is_empty());
    assert_eq!(h.orchestrator.outstanding_requests(), 1);

    h.run().await;

    assert_eq!(h.events, vec![SyncEvent::Stopped]);
    assert!(h.storage_log.is_empty());
    assert_eq!(h.orchestrator.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_stop_after_downloaded_chunk_never_finishes() {
    let (service, _, _) = account();
    let config = SyncConfig {
        max_entries_per_chunk: 2,
        ..Default::default()
    };
    let mut h = Harness::with_config(service, config);
    let actions = h.orchestrator.start(0);
    h.absorb(actions);
    let call = h.remote_queue.pop_front().unwrap();
    let response = h.client.execute(call).await;
    let actions = h.orchestrator.on_remote_response(response);
    h.absorb(actions);

    // One chunk is held unmerged and the next page is in flight.
    let actions = h.orchestrator.stop();
    h.absorb(actions);
    h.run().await;

    assert!(h.finished().is_none(), "{:?}", h.events);
    assert_eq!(h.events.last(), Some(&SyncEvent::Stopped));
    assert!(h.writes_since(0).is_empty());
    assert_eq!(h.orchestrator.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_clear_cancels_timers() {
    let (service, _, _) = account();
    service.fail_next(Operation::GetSyncChunk, rate_limit(30));
    let mut h = Harness::new(service);
    h.pull(0).await;
    let (armed, _) = h.timers[0];

    let actions = h.orchestrator.clear();
    h.absorb(actions);

    assert!(h.timers.is_empty());
    assert_eq!(h.orchestrator.state(), SyncState::Idle);
    assert!(h.orchestrator.on_timer(armed).is_empty());
}

#[tokio::test]
async fn test_expunged_entities_are_removed_incrementally() {
    let (service, _, _) = account();
    let doomed = service.put(tag("Obsolete"));
    let mut h = Harness::new(service);
    h.pull(0).await;
    let checkpoint = SyncCheckpoint::default().advanced_by(h.finished().unwrap()).unwrap();
    assert_eq!(h.storage.all(EntityKind::Tag).len(), 2);

    h.service().expunge(EntityKind::Tag, &guid_of(&doomed));
    h.events.clear();
    let actions = h.orchestrator.start_from(checkpoint);
    h.absorb(actions);
    h.run().await;

    assert!(h.finished().is_some(), "{:?}", h.events);
    assert!(h.storage.find_by_guid(EntityKind::Tag, &guid_of(&doomed)).is_none());
    assert_eq!(h.storage.all(EntityKind::Tag).len(), 1);
}

#[tokio::test]
async fn test_malformed_remote_guid_is_fatal() {
    let service = InMemoryNoteService::new();
    service.put(Tag {
        guid: Some(Guid::new("nope")),
        name: "Bad".into(),
        ..Default::default()
    });
    let mut h = Harness::new(service);

    h.pull(0).await;

    let failure = h.failure().unwrap();
    assert!(failure.contains("malformed guid"), "{failure}");
    assert!(h.storage_log.is_empty());
}

fn linked_account(names: &[&str]) -> (InMemoryNoteService, Vec<Guid>) {
    let service = InMemoryNoteService::new();
    service.set_current_time(NOW);
    let mut guids = Vec::new();
    for name in names {
        let linked = service.put(LinkedNotebook {
            share_name: (*name).into(),
            shared_notebook_global_id: Some(format!("share-{name}")),
            ..Default::default()
        });
        let linked_guid = guid_of(&linked);
        let notebook = service.put_linked(
            &linked_guid,
            Notebook {
                name: format!("{name} notebook"),
                ..Default::default()
            },
        );
        service.put_linked(&linked_guid, tag(&format!("{name} tag")));
        service.put_linked(
            &linked_guid,
            Note {
                title: format!("{name} note"),
                content: Some("<en-note>shared</en-note>".into()),
                notebook_guid: Some(guid_of(&notebook)),
                ..Default::default()
            },
        );
        guids.push(linked_guid);
    }
    (service, guids)
}

fn token(expires_ms: Option<Timestamp>) -> LinkedNotebookAuth {
    LinkedNotebookAuth {
        token: "shared-token".into(),
        expires_ms,
    }
}

#[tokio::test]
async fn test_linked_notebook_content_is_merged() {
    let (service, guids) = linked_account(&["Team"]);
    let linked = guids[0].clone();
    let mut h = Harness::new(service);

    h.pull(0).await;

    assert_eq!(h.orchestrator.state(), SyncState::DownloadingLinkedNotebookChunks);
    assert!(h.events.contains(&SyncEvent::RequestLinkedNotebookTokens {
        notebooks: vec![LinkedNotebookRef {
            guid: linked.clone(),
            shared_notebook_global_id: Some("share-Team".into()),
        }],
    }));

    let actions = h
        .orchestrator
        .on_linked_notebook_tokens(HashMap::from([(linked.clone(), token(None))]));
    h.absorb(actions);
    h.run().await;

    assert!(h.events.contains(&SyncEvent::LinkedNotebooksSyncChunksDownloaded));
    let Some(SyncEvent::Finished { linked_notebooks, .. }) = h.finished() else {
        panic!("not finished: {:?}", h.events);
    };
    assert_eq!(
        linked_notebooks.get(&linked).map(|p| p.update_count),
        h.service().linked_update_count(&linked)
    );

    let notebook = h.storage.find_by_name(EntityKind::Notebook, "Team notebook").unwrap();
    assert_eq!(notebook.as_notebook().unwrap().linked_notebook_guid.as_ref(), Some(&linked));
    match h.storage.find_by_name(EntityKind::Tag, "Team tag") {
        Some(Entity::Tag(tag)) => assert_eq!(tag.linked_notebook_guid.as_ref(), Some(&linked)),
        other => panic!("unexpected {:?}", other),
    }
    let note = h.storage.find_by_name(EntityKind::Note, "Team note").unwrap();
    assert_eq!(note.as_note().unwrap().notebook_local_id, Some(notebook.local_id()));
}

#[tokio::test]
async fn test_linked_tokens_are_requested_once_for_all() {
    let (service, guids) = linked_account(&["One", "Two"]);
    let mut h = Harness::new(service);

    h.pull(0).await;

    let requests: Vec<&SyncEvent> = h
        .events
        .iter()
        .filter(|e| matches!(e, SyncEvent::RequestLinkedNotebookTokens { .. }))
        .collect();
    assert_eq!(requests.len(), 1);
    let SyncEvent::RequestLinkedNotebookTokens { notebooks } = requests[0] else {
        unreachable!();
    };
    let mut requested: Vec<Guid> = notebooks.iter().map(|n| n.guid.clone()).collect();
    requested.sort();
    let mut expected = guids.clone();
    expected.sort();
    assert_eq!(requested, expected);
    assert_eq!(h.service().call_count(Operation::GetLinkedNotebookSyncChunk), 0);
}

#[tokio::test]
async fn test_expired_linked_token_counts_as_missing() {
    let (service, guids) = linked_account(&["Team"]);
    let mut h = Harness::new(service);
    let actions = h
        .orchestrator
        .on_linked_notebook_tokens(HashMap::from([(guids[0].clone(), token(Some(NOW - 1)))]));
    h.absorb(actions);

    h.pull(0).await;

    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, SyncEvent::RequestLinkedNotebookTokens { .. })));
    assert!(h.finished().is_none());
}

#[tokio::test]
async fn test_cached_linked_tokens_skip_the_request() {
    let (service, guids) = linked_account(&["Team"]);
    let mut h = Harness::new(service);
    let actions = h
        .orchestrator
        .on_linked_notebook_tokens(HashMap::from([(guids[0].clone(), token(Some(NOW + 60_000)))]));
    h.absorb(actions);

    h.pull(0).await;

    assert!(!h
        .events
        .iter()
        .any(|e| matches!(e, SyncEvent::RequestLinkedNotebookTokens { .. })));
    assert!(h.finished().is_some(), "{:?}", h.events);
}

#[tokio::test]
async fn test_one_missing_linked_token_requests_all_pending() {
    let (service, guids) = linked_account(&["One", "Two"]);
    let (cached, missing) = (guids[0].clone(), guids[1].clone());
    let mut h = Harness::new(service);
    let actions = h
        .orchestrator
        .on_linked_notebook_tokens(HashMap::from([(cached.clone(), token(None))]));
    h.absorb(actions);

    h.pull(0).await;

    let requested: Vec<&Vec<LinkedNotebookRef>> = h
        .events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::RequestLinkedNotebookTokens { notebooks } => Some(notebooks),
            _ => None,
        })
        .collect();
    assert_eq!(requested.len(), 1);
    let mut asked: Vec<Guid> = requested[0].iter().map(|n| n.guid.clone()).collect();
    asked.sort();
    let mut expected = vec![cached.clone(), missing.clone()];
    expected.sort();
    assert_eq!(asked, expected);
    assert!(h.orchestrator.has_valid_linked_token(&cached));
    assert!(!h.orchestrator.has_valid_linked_token(&missing));

    let actions = h
        .orchestrator
        .on_linked_notebook_tokens(HashMap::from([(missing.clone(), token(None))]));
    h.absorb(actions);
    h.run().await;

    assert!(h.finished().is_some(), "{:?}", h.events);
}

#[test]
fn test_token_cache_survives_clear() {
    let mut orchestrator =
        DownloadOrchestrator::with_clock(SyncConfig::default(), FixedClock(NOW)).unwrap();
    let guid = Guid::generate();
    orchestrator.on_linked_notebook_tokens(HashMap::from([(guid.clone(), token(None))]));

    orchestrator.clear();

    assert_eq!(orchestrator.linked_notebook_token(&guid), Some(&token(None)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = SyncConfig {
        max_entries_per_chunk: 0,
        ..Default::default()
    };
    assert!(matches!(
        DownloadOrchestrator::new(config),
        Err(ConfigError::NonPositiveChunkSize(0))
    ));
}

#[test]
fn test_validate_chunk() {
    let good = SyncChunk {
        chunk_high_usn: Some(3),
        update_count: 3,
        tags: vec![Tag {
            guid: Some(Guid::generate()),
            usn: Some(3),
            name: "ok".into(),
            ..Default::default()
        }],
        ..Default::default()
    };
    assert!(validate_chunk(&good, 0).is_ok());
    assert!(validate_chunk(&good, 3).unwrap_err().contains("does not advance"));

    let mut missing_usn = good.clone();
    missing_usn.tags[0].usn = None;
    assert!(validate_chunk(&missing_usn, 0).unwrap_err().contains("update sequence number"));

    let mut missing_guid = good.clone();
    missing_guid.tags[0].guid = None;
    assert!(validate_chunk(&missing_guid, 0).unwrap_err().contains("has no guid"));

    let empty = SyncChunk::default();
    assert!(validate_chunk(&empty, 5).is_ok());
}

#[test]
fn test_checkpoint_advances_only_on_finished() {
    let guid = Guid::generate();
    let start = SyncCheckpoint::new(4);
    let finished = SyncEvent::Finished {
        last_update_count: 9,
        last_sync_time: NOW,
        linked_notebooks: BTreeMap::from([(
            guid.clone(),
            LinkedSyncProgress {
                update_count: 3,
                sync_time: NOW,
            },
        )]),
    };

    let next = start.advanced_by(&finished).unwrap();
    assert_eq!(next.after_usn, 9);
    assert_eq!(next.linked_after_usn.get(&guid), Some(&3));
    assert!(start.advanced_by(&SyncEvent::Stopped).is_none());
}
