use super::NoteService;
use crate::action::NoteFetchOptions;
use crate::entity::{Entity, EntityKind, SyncEntity};
use crate::fault::{ErrorCode, Operation, RemoteFault};
use crate::types::{
    Guid, LinkedNotebook, Note, Notebook, Resource, SavedSearch, SyncChunk, SyncChunkFilter, Tag,
    Timestamp, Usn,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

/// Serializable account contents, used to seed an [`InMemoryNoteService`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountSnapshot {
    pub notebooks: Vec<Notebook>,
    pub tags: Vec<Tag>,
    pub searches: Vec<SavedSearch>,
    pub linked_notebooks: Vec<LinkedNotebook>,
    pub notes: Vec<Note>,
    pub resources: Vec<Resource>,
    /// Contents of shared notebooks, keyed by the linked notebook guid.
    pub linked_accounts: BTreeMap<Guid, AccountSnapshot>,
}

#[derive(Debug, Clone)]
enum Record {
    Live(Entity),
    Expunged { kind: EntityKind, guid: Guid, usn: Usn },
}

impl Record {
    fn usn(&self) -> Usn {
        match self {
            Record::Live(entity) => entity.usn().unwrap_or(0),
            Record::Expunged { usn, .. } => *usn,
        }
    }
}

/// One account's change log.
#[derive(Debug, Default)]
struct Account {
    update_count: Usn,
    records: Vec<Record>,
}

impl Account {
    fn from_snapshot(snapshot: AccountSnapshot) -> Self {
        let mut account = Account::default();
        let AccountSnapshot {
            notebooks,
            tags,
            searches,
            linked_notebooks,
            notes,
            resources,
            linked_accounts: _,
        } = snapshot;
        let entities = notebooks
            .into_iter()
            .map(Entity::from)
            .chain(tags.into_iter().map(Entity::from))
            .chain(searches.into_iter().map(Entity::from))
            .chain(linked_notebooks.into_iter().map(Entity::from))
            .chain(notes.into_iter().map(Entity::from))
            .chain(resources.into_iter().map(Entity::from));
        for entity in entities {
            account.upsert(entity);
        }
        account
    }

    fn bump(&mut self) -> Usn {
        self.update_count += 1;
        self.update_count
    }

    fn live(&self, kind: EntityKind, guid: &Guid) -> Option<&Entity> {
        self.records.iter().find_map(|record| match record {
            Record::Live(entity) if entity.kind() == kind && entity.guid() == Some(guid) => {
                Some(entity)
            }
            _ => None,
        })
    }

    fn remove_live(&mut self, kind: EntityKind, guid: &Guid) -> bool {
        let before = self.records.len();
        self.records.retain(|record| {
            !matches!(
                record,
                Record::Live(entity) if entity.kind() == kind && entity.guid() == Some(guid)
            )
        });
        before != self.records.len()
    }

    /// Store `entity` as a fresh remote revision with the next usn.
    fn upsert(&mut self, mut entity: Entity) -> Entity {
        let guid = entity.guid().cloned().unwrap_or_else(Guid::generate);
        self.remove_live(entity.kind(), &guid);
        let usn = self.bump();
        entity.set_guid(Some(guid));
        set_usn(&mut entity, usn);
        entity.set_dirty(false);
        entity.set_local(false);
        self.records.push(Record::Live(entity.clone()));
        entity
    }

    fn expunge(&mut self, kind: EntityKind, guid: &Guid) -> bool {
        if !self.remove_live(kind, guid) {
            return false;
        }
        let usn = self.bump();
        self.records.push(Record::Expunged {
            kind,
            guid: guid.clone(),
            usn,
        });
        true
    }

    fn chunk(
        &self,
        after_usn: Usn,
        max_entries: i32,
        filter: &SyncChunkFilter,
        current_time: Timestamp,
    ) -> SyncChunk {
        let mut pending: Vec<&Record> =
            self.records.iter().filter(|r| r.usn() > after_usn).collect();
        pending.sort_by_key(|r| r.usn());
        pending.truncate(max_entries.max(1) as usize);

        let mut chunk = SyncChunk {
            current_time,
            chunk_high_usn: pending.last().map(|r| r.usn()),
            update_count: self.update_count,
            ..Default::default()
        };

        for record in pending {
            match record {
                Record::Live(entity) => match entity.clone() {
                    Entity::Notebook(notebook) if filter.include_notebooks => {
                        chunk.notebooks.push(notebook)
                    }
                    Entity::Tag(tag) if filter.include_tags => chunk.tags.push(tag),
                    Entity::SavedSearch(search) if filter.include_searches => {
                        chunk.searches.push(search)
                    }
                    Entity::LinkedNotebook(linked) if filter.include_linked_notebooks => {
                        chunk.linked_notebooks.push(linked)
                    }
                    Entity::Note(mut note) if filter.include_notes => {
                        note.content = None;
                        for resource in &mut note.resources {
                            resource.data = None;
                        }
                        if !filter.include_note_resources {
                            note.resources.clear();
                        }
                        chunk.notes.push(note);
                    }
                    Entity::Resource(mut resource) if filter.include_resources => {
                        resource.data = None;
                        chunk.resources.push(resource);
                    }
                    _ => {}
                },
                Record::Expunged { kind, guid, .. } if filter.include_expunged => {
                    let list = match kind {
                        EntityKind::Note => &mut chunk.expunged_notes,
                        EntityKind::Notebook => &mut chunk.expunged_notebooks,
                        EntityKind::Tag => &mut chunk.expunged_tags,
                        EntityKind::SavedSearch => &mut chunk.expunged_searches,
                        EntityKind::LinkedNotebook => &mut chunk.expunged_linked_notebooks,
                        EntityKind::Resource => continue,
                    };
                    list.push(guid.clone());
                }
                Record::Expunged { .. } => {}
            }
        }
        chunk
    }

    fn full_note(&self, guid: &Guid, options: NoteFetchOptions) -> Option<Note> {
        let mut note = self.live(EntityKind::Note, guid)?.as_note()?.clone();
        for record in &self.records {
            if let Record::Live(Entity::Resource(resource)) = record {
                let attached = resource.note_guid.as_ref() == Some(guid);
                let listed = note.resources.iter().any(|r| r.guid == resource.guid);
                if attached && !listed {
                    note.resources.push(resource.clone());
                }
            }
        }
        if !options.with_content {
            note.content = None;
        }
        if !options.with_resources_data {
            for resource in &mut note.resources {
                resource.data = None;
            }
        }
        Some(note)
    }
}

fn set_usn(entity: &mut Entity, usn: Usn) {
    match entity {
        Entity::Tag(e) => e.usn = Some(usn),
        Entity::SavedSearch(e) => e.usn = Some(usn),
        Entity::LinkedNotebook(e) => e.usn = Some(usn),
        Entity::Notebook(e) => e.usn = Some(usn),
        Entity::Note(e) => e.usn = Some(usn),
        Entity::Resource(e) => e.usn = Some(usn),
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    account: Account,
    linked: HashMap<Guid, Account>,
    required_token: Option<String>,
    scripted: Vec<(Operation, RemoteFault)>,
    calls: Vec<Operation>,
    current_time: Timestamp,
}

impl ServiceState {
    /// Record the call, then fail it if a fault was scripted or the token is wrong.
    fn admit(&mut self, operation: Operation, auth_token: Option<&str>) -> Result<(), RemoteFault> {
        self.calls.push(operation);
        if let Some(index) = self.scripted.iter().position(|(op, _)| *op == operation) {
            let (_, fault) = self.scripted.remove(index);
            return Err(fault);
        }
        match (&self.required_token, auth_token) {
            (Some(required), Some(token)) if required != token => Err(RemoteFault::User {
                code: ErrorCode::AuthExpired,
                parameter: Some("authenticationToken".into()),
            }),
            _ => Ok(()),
        }
    }
}

/// In-process note service holding one account plus any shared notebooks.
///
/// Faults can be scripted per operation with [`InMemoryNoteService::fail_next`].
pub struct InMemoryNoteService {
    state: RwLock<ServiceState>,
}

impl InMemoryNoteService {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServiceState {
                current_time: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            }),
        }
    }

    pub fn from_snapshot(mut snapshot: AccountSnapshot) -> Self {
        let service = Self::new();
        {
            let mut state = service.lock();
            for (guid, linked) in std::mem::take(&mut snapshot.linked_accounts) {
                state.linked.insert(guid, Account::from_snapshot(linked));
            }
            state.account = Account::from_snapshot(snapshot);
        }
        service
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let snapshot: AccountSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    fn lock(&self) -> RwLockWriteGuard<'_, ServiceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a remote revision of `entity` in the account, as if another
    /// client had uploaded it. Returns the stored copy.
    pub fn put(&self, entity: impl Into<Entity>) -> Entity {
        self.lock().account.upsert(entity.into())
    }

    /// Store an entity in the shared notebook behind `linked_notebook_guid`.
    pub fn put_linked(&self, linked_notebook_guid: &Guid, entity: impl Into<Entity>) -> Entity {
        self.lock()
            .linked
            .entry(linked_notebook_guid.clone())
            .or_default()
            .upsert(entity.into())
    }

    pub fn expunge(&self, kind: EntityKind, guid: &Guid) -> bool {
        self.lock().account.expunge(kind, guid)
    }

    pub fn entity(&self, kind: EntityKind, guid: &Guid) -> Option<Entity> {
        self.lock().account.live(kind, guid).cloned()
    }

    pub fn update_count(&self) -> Usn {
        self.lock().account.update_count
    }

    pub fn linked_update_count(&self, linked_notebook_guid: &Guid) -> Option<Usn> {
        self.lock().linked.get(linked_notebook_guid).map(|a| a.update_count)
    }

    pub fn set_current_time(&self, now: Timestamp) {
        self.lock().current_time = now;
    }

    /// Fail the next call of `operation` with `fault`.
    pub fn fail_next(&self, operation: Operation, fault: RemoteFault) {
        self.lock().scripted.push((operation, fault));
    }

    /// Reject account calls whose token differs from `token`.
    pub fn require_token(&self, token: impl Into<String>) {
        self.lock().required_token = Some(token.into());
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock().calls.iter().filter(|op| **op == operation).count()
    }

    fn create(
        &self,
        operation: Operation,
        auth_token: &str,
        entity: Entity,
    ) -> Result<Entity, RemoteFault> {
        let mut state = self.lock();
        state.admit(operation, Some(auth_token))?;
        if entity.display_key().is_some_and(|key| key.trim().is_empty()) {
            return Err(RemoteFault::User {
                code: ErrorCode::BadDataFormat,
                parameter: Some(format!("{}.name", entity.kind().label())),
            });
        }
        if let Some(note) = entity.as_note() {
            check_note_notebook(&state.account, note)?;
        }
        let mut fresh = entity;
        fresh.set_guid(None);
        Ok(state.account.upsert(fresh))
    }

    fn update(
        &self,
        operation: Operation,
        auth_token: &str,
        entity: Entity,
    ) -> Result<Entity, RemoteFault> {
        let mut state = self.lock();
        state.admit(operation, Some(auth_token))?;
        let kind = entity.kind();
        let known = entity
            .guid()
            .is_some_and(|guid| state.account.live(kind, guid).is_some());
        if !known {
            return Err(RemoteFault::NotFound {
                identifier: Some(format!("{}.guid", kind.label())),
                key: entity.guid().map(|g| g.to_string()),
            });
        }
        if let Some(note) = entity.as_note() {
            check_note_notebook(&state.account, note)?;
        }
        Ok(state.account.upsert(entity))
    }
}

impl Default for InMemoryNoteService {
    fn default() -> Self {
        Self::new()
    }
}

fn check_note_notebook(account: &Account, note: &Note) -> Result<(), RemoteFault> {
    match &note.notebook_guid {
        Some(guid) if account.live(EntityKind::Notebook, guid).is_some() => Ok(()),
        other => Err(RemoteFault::NotFound {
            identifier: Some("Note.notebookGuid".into()),
            key: other.as_ref().map(|g| g.to_string()),
        }),
    }
}

fn usn_of(entity: &Entity) -> Result<Usn, RemoteFault> {
    entity.usn().ok_or_else(|| RemoteFault::System {
        code: ErrorCode::InternalError,
        message: Some("stored entity has no usn".into()),
        rate_limit_duration: None,
    })
}

fn unexpected_kind() -> RemoteFault {
    RemoteFault::System {
        code: ErrorCode::InternalError,
        message: Some("stored entity has unexpected kind".into()),
        rate_limit_duration: None,
    }
}

#[async_trait]
impl NoteService for InMemoryNoteService {
    async fn create_notebook(
        &self,
        auth_token: &str,
        notebook: &Notebook,
    ) -> Result<Notebook, RemoteFault> {
        match self.create(Operation::CreateNotebook, auth_token, notebook.clone().into())? {
            Entity::Notebook(created) => Ok(created),
            _ => Err(unexpected_kind()),
        }
    }

    async fn update_notebook(
        &self,
        auth_token: &str,
        notebook: &Notebook,
    ) -> Result<Usn, RemoteFault> {
        let stored = self.update(Operation::UpdateNotebook, auth_token, notebook.clone().into())?;
        usn_of(&stored)
    }

    async fn create_note(&self, auth_token: &str, note: &Note) -> Result<Note, RemoteFault> {
        self.create(Operation::CreateNote, auth_token, note.clone().into())?
            .into_note()
            .ok_or_else(unexpected_kind)
    }

    async fn update_note(&self, auth_token: &str, note: &Note) -> Result<Note, RemoteFault> {
        self.update(Operation::UpdateNote, auth_token, note.clone().into())?
            .into_note()
            .ok_or_else(unexpected_kind)
    }

    async fn create_tag(&self, auth_token: &str, tag: &Tag) -> Result<Tag, RemoteFault> {
        match self.create(Operation::CreateTag, auth_token, tag.clone().into())? {
            Entity::Tag(created) => Ok(created),
            _ => Err(unexpected_kind()),
        }
    }

    async fn update_tag(&self, auth_token: &str, tag: &Tag) -> Result<Usn, RemoteFault> {
        let stored = self.update(Operation::UpdateTag, auth_token, tag.clone().into())?;
        usn_of(&stored)
    }

    async fn create_search(
        &self,
        auth_token: &str,
        search: &SavedSearch,
    ) -> Result<SavedSearch, RemoteFault> {
        match self.create(Operation::CreateSavedSearch, auth_token, search.clone().into())? {
            Entity::SavedSearch(created) => Ok(created),
            _ => Err(unexpected_kind()),
        }
    }

    async fn update_search(
        &self,
        auth_token: &str,
        search: &SavedSearch,
    ) -> Result<Usn, RemoteFault> {
        let stored = self.update(Operation::UpdateSavedSearch, auth_token, search.clone().into())?;
        usn_of(&stored)
    }

    async fn get_sync_chunk(
        &self,
        auth_token: &str,
        after_usn: Usn,
        max_entries: i32,
        filter: &SyncChunkFilter,
    ) -> Result<SyncChunk, RemoteFault> {
        let mut state = self.lock();
        state.admit(Operation::GetSyncChunk, Some(auth_token))?;
        Ok(state.account.chunk(after_usn, max_entries, filter, state.current_time))
    }

    async fn get_linked_notebook_sync_chunk(
        &self,
        _auth_token: &str,
        linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
        full_sync_only: bool,
    ) -> Result<SyncChunk, RemoteFault> {
        let mut state = self.lock();
        state.admit(Operation::GetLinkedNotebookSyncChunk, None)?;
        let not_found = || RemoteFault::NotFound {
            identifier: Some("LinkedNotebook.guid".into()),
            key: linked_notebook.guid.as_ref().map(|g| g.to_string()),
        };
        let guid = linked_notebook.guid.as_ref().ok_or_else(not_found)?;
        let account = state.linked.get(guid).ok_or_else(not_found)?;

        let mut filter = SyncChunkFilter::for_mode(crate::types::SyncMode::Incremental);
        filter.include_linked_notebooks = false;
        filter.include_expunged = !full_sync_only;
        Ok(account.chunk(after_usn, max_entries, &filter, state.current_time))
    }

    async fn get_note(
        &self,
        auth_token: &str,
        guid: &Guid,
        options: NoteFetchOptions,
    ) -> Result<Note, RemoteFault> {
        let mut state = self.lock();
        state.admit(Operation::GetFullNote, Some(auth_token))?;
        let found = std::iter::once(&state.account)
            .chain(state.linked.values())
            .find_map(|account| account.full_note(guid, options));
        found.ok_or_else(|| RemoteFault::NotFound {
            identifier: Some("Note.guid".into()),
            key: Some(guid.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncMode;

    fn full_filter() -> SyncChunkFilter {
        SyncChunkFilter::for_mode(SyncMode::Incremental)
    }

    fn tag(name: &str) -> Tag {
        Tag {
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chunks_page_in_usn_order() {
        let service = InMemoryNoteService::new();
        for name in ["a", "b", "c", "d", "e"] {
            service.put(tag(name));
        }

        let first = service.get_sync_chunk("t", 0, 2, &full_filter()).await.unwrap();
        assert_eq!(first.tags.len(), 2);
        assert_eq!(first.chunk_high_usn, Some(2));
        assert_eq!(first.update_count, 5);
        assert!(!first.reaches_head());

        let last = service.get_sync_chunk("t", 4, 2, &full_filter()).await.unwrap();
        assert_eq!(last.tags.len(), 1);
        assert!(last.reaches_head());

        let empty = service.get_sync_chunk("t", 5, 2, &full_filter()).await.unwrap();
        assert_eq!(empty.chunk_high_usn, None);
        assert_eq!(empty.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_chunk_strips_note_content() {
        let service = InMemoryNoteService::new();
        let notebook = service.put(Notebook {
            name: "Inbox".into(),
            ..Default::default()
        });
        service.put(Note {
            title: "Body".into(),
            content: Some("<en-note/>".into()),
            notebook_guid: notebook.guid().cloned(),
            ..Default::default()
        });

        let chunk = service.get_sync_chunk("t", 0, 10, &full_filter()).await.unwrap();
        assert_eq!(chunk.notes.len(), 1);
        assert!(chunk.notes[0].content.is_none());
    }

    #[tokio::test]
    async fn test_expunged_guids_only_when_requested() {
        let service = InMemoryNoteService::new();
        let stored = service.put(tag("gone"));
        let guid = stored.guid().cloned().unwrap();
        assert!(service.expunge(EntityKind::Tag, &guid));

        let incremental = service.get_sync_chunk("t", 1, 10, &full_filter()).await.unwrap();
        assert_eq!(incremental.expunged_tags, vec![guid]);

        let full = SyncChunkFilter::for_mode(SyncMode::Full);
        let chunk = service.get_sync_chunk("t", 0, 10, &full).await.unwrap();
        assert!(chunk.expunged_tags.is_empty());
        assert!(chunk.tags.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_fault_fires_once() {
        let service = InMemoryNoteService::new();
        service.fail_next(
            Operation::GetSyncChunk,
            RemoteFault::Transport {
                message: "boom".into(),
            },
        );

        assert!(service.get_sync_chunk("t", 0, 10, &full_filter()).await.is_err());
        assert!(service.get_sync_chunk("t", 0, 10, &full_filter()).await.is_ok());
        assert_eq!(service.call_count(Operation::GetSyncChunk), 2);
    }

    #[tokio::test]
    async fn test_linked_chunk_reads_shared_account() {
        let service = InMemoryNoteService::new();
        let linked = service.put(LinkedNotebook {
            share_name: "Team".into(),
            ..Default::default()
        });
        let linked = linked.into_linked_notebook().unwrap();
        let linked_guid = linked.guid.clone().unwrap();
        service.put_linked(&linked_guid, tag("shared"));

        let chunk = service
            .get_linked_notebook_sync_chunk("share-token", &linked, 0, 10, true)
            .await
            .unwrap();
        assert_eq!(chunk.tags.len(), 1);
        assert_eq!(service.linked_update_count(&linked_guid), Some(1));
    }

    #[tokio::test]
    async fn test_create_note_requires_known_notebook() {
        let service = InMemoryNoteService::new();
        let note = Note {
            title: "Lost".into(),
            notebook_guid: Some(Guid::generate()),
            ..Default::default()
        };
        let fault = service.create_note("t", &note).await.unwrap_err();
        assert!(matches!(fault, RemoteFault::NotFound { .. }));
    }

    #[test]
    fn test_snapshot_assigns_guids_and_usns() {
        let json = r#"{
            "notebooks": [{"name": "Inbox"}],
            "tags": [{"name": "work"}, {"name": "home"}]
        }"#;
        let service = InMemoryNoteService::from_json(json).unwrap();
        assert_eq!(service.update_count(), 3);
    }
}
