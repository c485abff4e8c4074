//! Remote note service access.
//!
//! [`NoteService`] is the raw transport seam: every call either returns the
//! service's answer or a [`RemoteFault`]. [`RemoteNoteClient`] wraps it,
//! holds the current authentication token and turns faults into
//! [`RemoteError`]s. It never retries; scheduling a retry is the caller's job.
//!
//! Implementations:
//! - `InMemoryNoteService` - in-process account used by tests and the runner

mod memory;

pub use memory::{AccountSnapshot, InMemoryNoteService};

use crate::action::{NoteFetchOptions, RemoteCall, RemotePayload, RemoteRequest, RemoteResponse};
use crate::entity::Entity;
use crate::fault::{translate, Operation, RemoteError, RemoteFault};
use crate::types::{
    Guid, LinkedNotebook, Note, Notebook, SavedSearch, SyncChunk, SyncChunkFilter, Tag, Usn,
};
use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};

/// Raw remote note service API.
#[async_trait]
pub trait NoteService: Send + Sync {
    /// Create a notebook; the answer carries the assigned guid and usn.
    async fn create_notebook(
        &self,
        auth_token: &str,
        notebook: &Notebook,
    ) -> Result<Notebook, RemoteFault>;

    /// Update a notebook; answers the new usn.
    async fn update_notebook(
        &self,
        auth_token: &str,
        notebook: &Notebook,
    ) -> Result<Usn, RemoteFault>;

    async fn create_note(&self, auth_token: &str, note: &Note) -> Result<Note, RemoteFault>;

    async fn update_note(&self, auth_token: &str, note: &Note) -> Result<Note, RemoteFault>;

    async fn create_tag(&self, auth_token: &str, tag: &Tag) -> Result<Tag, RemoteFault>;

    async fn update_tag(&self, auth_token: &str, tag: &Tag) -> Result<Usn, RemoteFault>;

    async fn create_search(
        &self,
        auth_token: &str,
        search: &SavedSearch,
    ) -> Result<SavedSearch, RemoteFault>;

    async fn update_search(
        &self,
        auth_token: &str,
        search: &SavedSearch,
    ) -> Result<Usn, RemoteFault>;

    /// Page of the account change feed with entities whose usn is above `after_usn`.
    async fn get_sync_chunk(
        &self,
        auth_token: &str,
        after_usn: Usn,
        max_entries: i32,
        filter: &SyncChunkFilter,
    ) -> Result<SyncChunk, RemoteFault>;

    /// Page of a shared notebook's change feed, authenticated with that share's token.
    async fn get_linked_notebook_sync_chunk(
        &self,
        auth_token: &str,
        linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
        full_sync_only: bool,
    ) -> Result<SyncChunk, RemoteFault>;

    async fn get_note(
        &self,
        auth_token: &str,
        guid: &Guid,
        options: NoteFetchOptions,
    ) -> Result<Note, RemoteFault>;
}

/// Typed client over a [`NoteService`].
pub struct RemoteNoteClient<S> {
    service: S,
    auth_token: RwLock<String>,
}

impl<S: NoteService> RemoteNoteClient<S> {
    pub fn new(service: S, auth_token: impl Into<String>) -> Self {
        Self {
            service,
            auth_token: RwLock::new(auth_token.into()),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Replace the account token, e.g. after the previous one expired.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.write().unwrap_or_else(PoisonError::into_inner) = token.into();
    }

    fn token(&self) -> String {
        self.auth_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Create a notebook and return the local copy with the assigned guid and usn.
    pub async fn create_notebook(&self, notebook: &Notebook) -> Result<Notebook, RemoteError> {
        let token = self.token();
        let created = self
            .service
            .create_notebook(&token, notebook)
            .await
            .map_err(|fault| fail(Operation::CreateNotebook, notebook.clone(), &fault))?;
        let mut out = notebook.clone();
        out.guid = Some(require_guid(Operation::CreateNotebook, created.guid)?);
        out.usn = Some(require_usn(Operation::CreateNotebook, created.usn)?);
        Ok(out)
    }

    pub async fn update_notebook(&self, notebook: &Notebook) -> Result<Notebook, RemoteError> {
        let token = self.token();
        let usn = self
            .service
            .update_notebook(&token, notebook)
            .await
            .map_err(|fault| fail(Operation::UpdateNotebook, notebook.clone(), &fault))?;
        let mut out = notebook.clone();
        out.usn = Some(usn);
        Ok(out)
    }

    pub async fn create_note(&self, note: &Note) -> Result<Note, RemoteError> {
        let token = self.token();
        let created = self
            .service
            .create_note(&token, note)
            .await
            .map_err(|fault| fail(Operation::CreateNote, note.clone(), &fault))?;
        let mut out = note.clone();
        out.guid = Some(require_guid(Operation::CreateNote, created.guid)?);
        out.usn = Some(require_usn(Operation::CreateNote, created.usn)?);
        Ok(out)
    }

    pub async fn update_note(&self, note: &Note) -> Result<Note, RemoteError> {
        let token = self.token();
        let updated = self
            .service
            .update_note(&token, note)
            .await
            .map_err(|fault| fail(Operation::UpdateNote, note.clone(), &fault))?;
        let mut out = note.clone();
        out.usn = Some(require_usn(Operation::UpdateNote, updated.usn)?);
        Ok(out)
    }

    pub async fn create_tag(&self, tag: &Tag) -> Result<Tag, RemoteError> {
        let token = self.token();
        let created = self
            .service
            .create_tag(&token, tag)
            .await
            .map_err(|fault| fail(Operation::CreateTag, tag.clone(), &fault))?;
        let mut out = tag.clone();
        out.guid = Some(require_guid(Operation::CreateTag, created.guid)?);
        out.usn = Some(require_usn(Operation::CreateTag, created.usn)?);
        Ok(out)
    }

    pub async fn update_tag(&self, tag: &Tag) -> Result<Tag, RemoteError> {
        let token = self.token();
        let usn = self
            .service
            .update_tag(&token, tag)
            .await
            .map_err(|fault| fail(Operation::UpdateTag, tag.clone(), &fault))?;
        let mut out = tag.clone();
        out.usn = Some(usn);
        Ok(out)
    }

    pub async fn create_saved_search(
        &self,
        search: &SavedSearch,
    ) -> Result<SavedSearch, RemoteError> {
        let token = self.token();
        let created = self
            .service
            .create_search(&token, search)
            .await
            .map_err(|fault| fail(Operation::CreateSavedSearch, search.clone(), &fault))?;
        let mut out = search.clone();
        out.guid = Some(require_guid(Operation::CreateSavedSearch, created.guid)?);
        out.usn = Some(require_usn(Operation::CreateSavedSearch, created.usn)?);
        Ok(out)
    }

    pub async fn update_saved_search(
        &self,
        search: &SavedSearch,
    ) -> Result<SavedSearch, RemoteError> {
        let token = self.token();
        let usn = self
            .service
            .update_search(&token, search)
            .await
            .map_err(|fault| fail(Operation::UpdateSavedSearch, search.clone(), &fault))?;
        let mut out = search.clone();
        out.usn = Some(usn);
        Ok(out)
    }

    pub async fn get_sync_chunk(
        &self,
        after_usn: Usn,
        max_entries: i32,
        filter: &SyncChunkFilter,
    ) -> Result<SyncChunk, RemoteError> {
        let token = self.token();
        self.service
            .get_sync_chunk(&token, after_usn, max_entries, filter)
            .await
            .map_err(|fault| translate(Operation::GetSyncChunk, None, &fault))
    }

    /// Uses the share's own token rather than the account token.
    pub async fn get_linked_notebook_sync_chunk(
        &self,
        linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        max_entries: i32,
        auth_token: &str,
        full_sync_only: bool,
    ) -> Result<SyncChunk, RemoteError> {
        self.service
            .get_linked_notebook_sync_chunk(
                auth_token,
                linked_notebook,
                after_usn,
                max_entries,
                full_sync_only,
            )
            .await
            .map_err(|fault| {
                translate(
                    Operation::GetLinkedNotebookSyncChunk,
                    Some(&Entity::from(linked_notebook.clone())),
                    &fault,
                )
            })
    }

    pub async fn get_full_note(
        &self,
        guid: &Guid,
        options: NoteFetchOptions,
    ) -> Result<Note, RemoteError> {
        let token = self.token();
        let note = self.service.get_note(&token, guid, options).await.map_err(|fault| {
            let subject = Note {
                guid: Some(guid.clone()),
                ..Default::default()
            };
            fail(Operation::GetFullNote, subject, &fault)
        })?;
        if note.guid.as_ref() != Some(guid) {
            return Err(RemoteError::internal(format!(
                "Failed to download full note: requested {} but received {}",
                guid,
                note.guid.as_ref().map(Guid::as_str).unwrap_or("a note without guid")
            )));
        }
        Ok(note)
    }

    /// Run one queued remote call and wrap the result for the state machine.
    pub async fn execute(&self, call: RemoteCall) -> RemoteResponse {
        let RemoteCall { id, request } = call;
        let result = match request {
            RemoteRequest::SyncChunk {
                after_usn,
                max_entries,
                filter,
            } => self
                .get_sync_chunk(after_usn, max_entries, &filter)
                .await
                .map(RemotePayload::SyncChunk),
            RemoteRequest::LinkedNotebookSyncChunk {
                linked_notebook,
                after_usn,
                max_entries,
                auth_token,
                full_sync_only,
            } => self
                .get_linked_notebook_sync_chunk(
                    &linked_notebook,
                    after_usn,
                    max_entries,
                    &auth_token,
                    full_sync_only,
                )
                .await
                .map(RemotePayload::SyncChunk),
            RemoteRequest::FullNote { guid, options } => {
                self.get_full_note(&guid, options).await.map(RemotePayload::Note)
            }
        };
        RemoteResponse { id, result }
    }
}

fn fail(operation: Operation, subject: impl Into<Entity>, fault: &RemoteFault) -> RemoteError {
    let subject = subject.into();
    translate(operation, Some(&subject), fault)
}

fn require_guid(operation: Operation, guid: Option<Guid>) -> Result<Guid, RemoteError> {
    guid.ok_or_else(|| {
        RemoteError::internal(format!("Failed to {}: service returned no guid", operation.verb()))
    })
}

fn require_usn(operation: Operation, usn: Option<Usn>) -> Result<Usn, RemoteError> {
    usn.ok_or_else(|| {
        RemoteError::internal(format!(
            "Failed to {}: service returned no update sequence number",
            operation.verb()
        ))
    })
}
