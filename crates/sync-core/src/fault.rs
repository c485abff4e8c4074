//! Translation of remote-service faults into typed, actionable outcomes.
//!
//! The note service reports failures as one of three exception shapes (user,
//! system, not-found). User exceptions name the offending parameter as a
//! string; that string is parsed once into [`FaultParameter`] and every
//! description is then chosen by matching on
//! `(entity kind, operation, error code, parameter)`.
//!
//! Translation is pure and infallible: the worst case is a generic message.

use crate::entity::Entity;
use crate::types::{Note, Notebook, SavedSearch, Tag};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Outcome taxonomy surfaced to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    BadDataFormat,
    DataConflict,
    DataRequired,
    EnmlValidation,
    LimitReached,
    PermissionDenied,
    QuotaReached,
    RateLimitReached,
    AuthExpired,
    NotFound,
    UnexpectedUserFault,
    SystemFault,
    /// Data that must hold by contract did not (missing guid, malformed retry
    /// duration, ...). Always fatal.
    InternalInconsistency,
}

/// Error codes carried by user and system exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    BadDataFormat,
    PermissionDenied,
    InternalError,
    DataRequired,
    LimitReached,
    QuotaReached,
    InvalidAuth,
    AuthExpired,
    DataConflict,
    EnmlValidation,
    ShardUnavailable,
    LenTooShort,
    LenTooLong,
    TooFew,
    TooMany,
    UnsupportedOperation,
    TakenDown,
    RateLimitReached,
}

impl ErrorCode {
    /// Decode the numeric code used on the wire.
    pub fn from_wire(code: i32) -> Option<Self> {
        let code = match code {
            1 => ErrorCode::Unknown,
            2 => ErrorCode::BadDataFormat,
            3 => ErrorCode::PermissionDenied,
            4 => ErrorCode::InternalError,
            5 => ErrorCode::DataRequired,
            6 => ErrorCode::LimitReached,
            7 => ErrorCode::QuotaReached,
            8 => ErrorCode::InvalidAuth,
            9 => ErrorCode::AuthExpired,
            10 => ErrorCode::DataConflict,
            11 => ErrorCode::EnmlValidation,
            12 => ErrorCode::ShardUnavailable,
            13 => ErrorCode::LenTooShort,
            14 => ErrorCode::LenTooLong,
            15 => ErrorCode::TooFew,
            16 => ErrorCode::TooMany,
            17 => ErrorCode::UnsupportedOperation,
            18 => ErrorCode::TakenDown,
            19 => ErrorCode::RateLimitReached,
            _ => return None,
        };
        Some(code)
    }

    fn user_kind(self) -> ErrorKind {
        match self {
            ErrorCode::BadDataFormat => ErrorKind::BadDataFormat,
            ErrorCode::DataConflict => ErrorKind::DataConflict,
            ErrorCode::DataRequired => ErrorKind::DataRequired,
            ErrorCode::EnmlValidation => ErrorKind::EnmlValidation,
            ErrorCode::LimitReached => ErrorKind::LimitReached,
            ErrorCode::PermissionDenied => ErrorKind::PermissionDenied,
            ErrorCode::QuotaReached => ErrorKind::QuotaReached,
            ErrorCode::RateLimitReached => ErrorKind::RateLimitReached,
            ErrorCode::AuthExpired => ErrorKind::AuthExpired,
            _ => ErrorKind::UnexpectedUserFault,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::BadDataFormat => "bad data format",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::InternalError => "internal error",
            ErrorCode::DataRequired => "data required",
            ErrorCode::LimitReached => "limit reached",
            ErrorCode::QuotaReached => "quota reached",
            ErrorCode::InvalidAuth => "invalid authentication",
            ErrorCode::AuthExpired => "authentication expired",
            ErrorCode::DataConflict => "data conflict",
            ErrorCode::EnmlValidation => "ENML validation",
            ErrorCode::ShardUnavailable => "shard unavailable",
            ErrorCode::LenTooShort => "length too short",
            ErrorCode::LenTooLong => "length too long",
            ErrorCode::TooFew => "too few",
            ErrorCode::TooMany => "too many",
            ErrorCode::UnsupportedOperation => "unsupported operation",
            ErrorCode::TakenDown => "content taken down",
            ErrorCode::RateLimitReached => "rate limit reached",
        }
    }
}

/// Raw failure reported by the note service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "camelCase")]
pub enum RemoteFault {
    /// The request was rejected because of something the caller sent.
    User {
        code: ErrorCode,
        parameter: Option<String>,
    },
    /// The service failed or throttled the caller.
    System {
        code: ErrorCode,
        message: Option<String>,
        /// Seconds to wait, present for rate-limit faults.
        rate_limit_duration: Option<i32>,
    },
    NotFound {
        identifier: Option<String>,
        key: Option<String>,
    },
    /// The request never reached the service or the response was unreadable.
    Transport { message: String },
}

/// Offending parameter named by a user exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultParameter {
    None,
    AuthenticationToken,
    AccountingUploadLimit,
    AfterUsn,
    MaxEntries,
    Notebook,
    NotebookName,
    NotebookStack,
    NotebookGuid,
    PublishingUri,
    PublishingPublicDescription,
    Note,
    NoteTitle,
    NoteContent,
    NoteNotebookGuid,
    NoteTags,
    NoteTagGuids,
    NoteResources,
    NoteSize,
    NoteAttributes,
    ResourceData,
    ResourceMime,
    Tag,
    TagName,
    TagParentGuid,
    SavedSearch,
    SavedSearchName,
    SavedSearchQuery,
    LinkedNotebook,
    Unrecognized(String),
}

impl FaultParameter {
    pub fn from_wire(parameter: Option<&str>) -> Self {
        let Some(parameter) = parameter else {
            return FaultParameter::None;
        };
        match parameter {
            "" => FaultParameter::None,
            "authenticationToken" => FaultParameter::AuthenticationToken,
            "Accounting.uploadLimit" => FaultParameter::AccountingUploadLimit,
            "afterUSN" => FaultParameter::AfterUsn,
            "maxEntries" => FaultParameter::MaxEntries,
            "Notebook" => FaultParameter::Notebook,
            "Notebook.name" => FaultParameter::NotebookName,
            "Notebook.stack" => FaultParameter::NotebookStack,
            "Notebook.guid" => FaultParameter::NotebookGuid,
            "Publishing.uri" => FaultParameter::PublishingUri,
            "Publishing.publicDescription" => FaultParameter::PublishingPublicDescription,
            "Note" => FaultParameter::Note,
            "Note.title" => FaultParameter::NoteTitle,
            "Note.content" => FaultParameter::NoteContent,
            "Note.notebookGuid" => FaultParameter::NoteNotebookGuid,
            "Note.tags" => FaultParameter::NoteTags,
            "Note.tagGuids" => FaultParameter::NoteTagGuids,
            "Note.resources" => FaultParameter::NoteResources,
            "Note.size" => FaultParameter::NoteSize,
            "Note.attributes" => FaultParameter::NoteAttributes,
            "Resource.data" => FaultParameter::ResourceData,
            "Resource.mime" => FaultParameter::ResourceMime,
            "Tag" => FaultParameter::Tag,
            "Tag.name" => FaultParameter::TagName,
            "Tag.parentGuid" => FaultParameter::TagParentGuid,
            "SavedSearch" => FaultParameter::SavedSearch,
            "SavedSearch.name" => FaultParameter::SavedSearchName,
            "SavedSearch.query" => FaultParameter::SavedSearchQuery,
            "LinkedNotebook" => FaultParameter::LinkedNotebook,
            other => FaultParameter::Unrecognized(other.to_string()),
        }
    }
}

/// Remote operation that produced a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    CreateNotebook,
    UpdateNotebook,
    CreateNote,
    UpdateNote,
    CreateTag,
    UpdateTag,
    CreateSavedSearch,
    UpdateSavedSearch,
    GetSyncChunk,
    GetLinkedNotebookSyncChunk,
    GetFullNote,
}

impl Operation {
    pub fn verb(self) -> &'static str {
        match self {
            Operation::CreateNotebook => "create notebook",
            Operation::UpdateNotebook => "update notebook",
            Operation::CreateNote => "create note",
            Operation::UpdateNote => "update note",
            Operation::CreateTag => "create tag",
            Operation::UpdateTag => "update tag",
            Operation::CreateSavedSearch => "create saved search",
            Operation::UpdateSavedSearch => "update saved search",
            Operation::GetSyncChunk => "download sync chunk",
            Operation::GetLinkedNotebookSyncChunk => "download linked notebook sync chunk",
            Operation::GetFullNote => "download full note",
        }
    }

    fn is_create(self) -> bool {
        matches!(
            self,
            Operation::CreateNotebook
                | Operation::CreateNote
                | Operation::CreateTag
                | Operation::CreateSavedSearch
        )
    }
}

/// Translated failure of a remote call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{description}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub description: String,
    /// Set only for rate-limit faults.
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            retry_after: None,
        }
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalInconsistency, description)
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == ErrorKind::RateLimitReached
    }
}

/// Translate a fault raised by `operation` while acting on `subject`.
pub fn translate(
    operation: Operation,
    subject: Option<&Entity>,
    fault: &RemoteFault,
) -> RemoteError {
    match fault {
        RemoteFault::User { code, parameter } => {
            let parameter = FaultParameter::from_wire(parameter.as_deref());
            translate_user_fault(operation, subject, *code, &parameter)
        }
        RemoteFault::System {
            code,
            message,
            rate_limit_duration,
        } => translate_system_fault(operation, *code, message.as_deref(), *rate_limit_duration),
        RemoteFault::NotFound { identifier, key } => {
            let detail = match (identifier, key) {
                (Some(identifier), Some(key)) => format!("not found: {} = {}", identifier, key),
                (Some(identifier), None) => format!("not found: {}", identifier),
                (None, Some(key)) => format!("not found: {}", key),
                (None, None) => "entity not found".to_string(),
            };
            RemoteError::new(ErrorKind::NotFound, failed_to(operation, &detail))
        }
        RemoteFault::Transport { message } => RemoteError::new(
            ErrorKind::SystemFault,
            failed_to(operation, &format!("transport error: {}", message)),
        ),
    }
}

fn failed_to(operation: Operation, detail: &str) -> String {
    format!("Failed to {}: {}", operation.verb(), detail)
}

fn translate_system_fault(
    operation: Operation,
    code: ErrorCode,
    message: Option<&str>,
    rate_limit_duration: Option<i32>,
) -> RemoteError {
    match code {
        ErrorCode::RateLimitReached => match rate_limit_duration {
            Some(seconds) if seconds > 0 => RemoteError {
                kind: ErrorKind::RateLimitReached,
                description: failed_to(
                    operation,
                    &format!("rate limit reached, retry in {} seconds", seconds),
                ),
                retry_after: Some(Duration::from_secs(seconds as u64)),
            },
            other => RemoteError::internal(failed_to(
                operation,
                &format!(
                    "rate limit reached but the service sent an invalid retry duration ({})",
                    other.map_or_else(|| "none".to_string(), |s| s.to_string())
                ),
            )),
        },
        ErrorCode::AuthExpired => RemoteError::new(
            ErrorKind::AuthExpired,
            failed_to(operation, "authentication token expired"),
        ),
        _ => {
            let mut detail = format!("system error ({})", code.label());
            if let Some(message) = message.filter(|m| !m.is_empty()) {
                detail.push_str(&format!(": {}", message));
            }
            RemoteError::new(ErrorKind::SystemFault, failed_to(operation, &detail))
        }
    }
}

fn translate_user_fault(
    operation: Operation,
    subject: Option<&Entity>,
    code: ErrorCode,
    parameter: &FaultParameter,
) -> RemoteError {
    let kind = code.user_kind();

    if code == ErrorCode::AuthExpired {
        return RemoteError::new(kind, failed_to(operation, "authentication token expired"));
    }

    let detail = match (operation, subject) {
        (
            Operation::CreateNotebook | Operation::UpdateNotebook,
            Some(Entity::Notebook(notebook)),
        ) => notebook_fault(operation, code, parameter, notebook),
        (Operation::CreateNote | Operation::UpdateNote, Some(Entity::Note(note))) => {
            note_fault(operation, code, parameter, note)
        }
        (Operation::CreateTag | Operation::UpdateTag, Some(Entity::Tag(tag))) => {
            tag_fault(operation, code, parameter, tag)
        }
        (
            Operation::CreateSavedSearch | Operation::UpdateSavedSearch,
            Some(Entity::SavedSearch(search)),
        ) => saved_search_fault(code, parameter, search),
        (Operation::GetFullNote, _) => full_note_fault(code, parameter),
        (Operation::GetSyncChunk | Operation::GetLinkedNotebookSyncChunk, _) => {
            sync_chunk_fault(code, parameter)
        }
        _ => None,
    };

    let detail = detail.unwrap_or_else(|| generic_user_fault(code, parameter));
    RemoteError::new(kind, failed_to(operation, &detail))
}

/// Fallback wording: unknown parameter for a known code, or an unknown code.
fn generic_user_fault(code: ErrorCode, parameter: &FaultParameter) -> String {
    match parameter {
        FaultParameter::None => format!("unexpected {} error", code.label()),
        FaultParameter::Unrecognized(name) => {
            format!("{} error, unexpected parameter: {}", code.label(), name)
        }
        known => format!("{} error, unexpected parameter: {:?}", code.label(), known),
    }
}

fn quoted(value: Option<&str>) -> String {
    match value {
        Some(value) => format!("\"{}\"", value),
        None => "<not set>".to_string(),
    }
}

fn notebook_fault(
    operation: Operation,
    code: ErrorCode,
    parameter: &FaultParameter,
    notebook: &Notebook,
) -> Option<String> {
    use FaultParameter as P;
    let text = match (code, parameter) {
        (ErrorCode::BadDataFormat, P::NotebookName) => {
            format!("notebook name invalid: {}", quoted(Some(&notebook.name)))
        }
        (ErrorCode::BadDataFormat, P::NotebookStack) => {
            format!("notebook stack invalid: {}", quoted(notebook.stack.as_deref()))
        }
        (ErrorCode::BadDataFormat, P::PublishingUri) => format!(
            "notebook publishing uri invalid: {}",
            quoted(notebook.publishing_uri.as_deref())
        ),
        (ErrorCode::BadDataFormat, P::PublishingPublicDescription) => format!(
            "notebook public description invalid: {}",
            quoted(notebook.publishing_description.as_deref())
        ),
        (ErrorCode::DataConflict, P::NotebookName) => format!(
            "a notebook named {} already exists",
            quoted(Some(&notebook.name))
        ),
        (ErrorCode::DataConflict, P::PublishingUri) => format!(
            "notebook publishing uri is already in use: {}",
            quoted(notebook.publishing_uri.as_deref())
        ),
        (ErrorCode::DataRequired, P::PublishingUri) => {
            "notebook is published but has no publishing uri".to_string()
        }
        (ErrorCode::DataRequired, P::NotebookName) => "notebook name is not set".to_string(),
        (ErrorCode::LimitReached, P::Notebook) => {
            "reached the maximum number of notebooks per account".to_string()
        }
        (ErrorCode::PermissionDenied, P::Notebook) if !operation.is_create() => {
            "notebook is not owned by the user".to_string()
        }
        (ErrorCode::PermissionDenied, P::Notebook) => {
            "account is not allowed to create notebooks".to_string()
        }
        _ => return None,
    };
    Some(text)
}

fn note_fault(
    operation: Operation,
    code: ErrorCode,
    parameter: &FaultParameter,
    note: &Note,
) -> Option<String> {
    use FaultParameter as P;
    let text = match (code, parameter) {
        (ErrorCode::BadDataFormat, P::NoteTitle) => {
            format!("note title invalid: {}", quoted(Some(&note.title)))
        }
        (ErrorCode::BadDataFormat, P::NoteContent) => format!(
            "note content invalid ({} characters)",
            note.content.as_ref().map_or(0, |c| c.chars().count())
        ),
        (ErrorCode::BadDataFormat, P::NoteTags) => "note carries an invalid tag name".to_string(),
        (ErrorCode::BadDataFormat, P::NoteAttributes) => "note attributes invalid".to_string(),
        (ErrorCode::BadDataFormat, P::ResourceMime) => {
            "note carries a resource with an invalid mime type".to_string()
        }
        (ErrorCode::DataRequired, P::ResourceData) => {
            "note carries a resource without a data body".to_string()
        }
        (ErrorCode::EnmlValidation, _) => {
            "note content does not validate against the ENML DTD".to_string()
        }
        (ErrorCode::LimitReached, P::Note) => {
            "reached the maximum number of notes per account".to_string()
        }
        (ErrorCode::LimitReached, P::NoteResources) => format!(
            "note has too many resources ({})",
            note.resources.len()
        ),
        (ErrorCode::LimitReached, P::NoteSize) => "note exceeds the maximum size".to_string(),
        (ErrorCode::LimitReached, P::ResourceData) => {
            "a note resource exceeds the maximum size".to_string()
        }
        (ErrorCode::LimitReached, P::NoteTags | P::NoteTagGuids) => {
            format!("note has too many tags ({})", note.tag_guids.len())
        }
        (ErrorCode::PermissionDenied, P::NoteNotebookGuid) if operation.is_create() => format!(
            "notebook restrictions forbid note creation in notebook {}",
            quoted(note.notebook_guid.as_ref().map(|g| g.as_str()))
        ),
        (ErrorCode::PermissionDenied, P::NoteNotebookGuid) => format!(
            "note's notebook is not owned by the user: {}",
            quoted(note.notebook_guid.as_ref().map(|g| g.as_str()))
        ),
        (ErrorCode::PermissionDenied, P::Note) => "note is not owned by the user".to_string(),
        (ErrorCode::QuotaReached, P::AccountingUploadLimit) => {
            "account upload quota reached".to_string()
        }
        _ => return None,
    };
    Some(text)
}

fn tag_fault(
    operation: Operation,
    code: ErrorCode,
    parameter: &FaultParameter,
    tag: &Tag,
) -> Option<String> {
    use FaultParameter as P;
    let text = match (code, parameter) {
        (ErrorCode::BadDataFormat, P::TagName) => {
            format!("tag name invalid: {}", quoted(Some(&tag.name)))
        }
        (ErrorCode::BadDataFormat, P::TagParentGuid) => format!(
            "tag parent guid invalid: {}",
            quoted(tag.parent_guid.as_ref().map(|g| g.as_str()))
        ),
        (ErrorCode::DataConflict, P::TagName) => {
            format!("a tag named {} already exists", quoted(Some(&tag.name)))
        }
        (ErrorCode::DataConflict, P::TagParentGuid) if !operation.is_create() => format!(
            "parent guid {} would create a cycle in the tag hierarchy",
            quoted(tag.parent_guid.as_ref().map(|g| g.as_str()))
        ),
        (ErrorCode::LimitReached, P::Tag) => {
            "reached the maximum number of tags per account".to_string()
        }
        (ErrorCode::PermissionDenied, P::Tag) => "tag is not owned by the user".to_string(),
        _ => return None,
    };
    Some(text)
}

fn saved_search_fault(
    code: ErrorCode,
    parameter: &FaultParameter,
    search: &SavedSearch,
) -> Option<String> {
    use FaultParameter as P;
    let text = match (code, parameter) {
        (ErrorCode::BadDataFormat, P::SavedSearchName) => {
            format!("saved search name invalid: {}", quoted(Some(&search.name)))
        }
        (ErrorCode::BadDataFormat, P::SavedSearchQuery) => format!(
            "saved search query invalid: {}",
            quoted(search.query.as_deref())
        ),
        (ErrorCode::DataConflict, P::SavedSearchName) => format!(
            "a saved search named {} already exists",
            quoted(Some(&search.name))
        ),
        (ErrorCode::LimitReached, P::SavedSearch) => {
            "reached the maximum number of saved searches per account".to_string()
        }
        (ErrorCode::PermissionDenied, P::SavedSearch) => {
            "saved search is not owned by the user".to_string()
        }
        _ => return None,
    };
    Some(text)
}

fn full_note_fault(code: ErrorCode, parameter: &FaultParameter) -> Option<String> {
    use FaultParameter as P;
    let text = match (code, parameter) {
        (ErrorCode::PermissionDenied, P::Note) => "no permission to read the note".to_string(),
        (ErrorCode::BadDataFormat, P::Note) => "note guid is malformed".to_string(),
        _ => return None,
    };
    Some(text)
}

fn sync_chunk_fault(code: ErrorCode, parameter: &FaultParameter) -> Option<String> {
    use FaultParameter as P;
    let text = match (code, parameter) {
        (ErrorCode::BadDataFormat, P::AfterUsn) => "afterUSN is negative".to_string(),
        (ErrorCode::BadDataFormat, P::MaxEntries) => "maxEntries is out of range".to_string(),
        (ErrorCode::PermissionDenied, P::LinkedNotebook) => {
            "no access to the linked notebook".to_string()
        }
        (ErrorCode::PermissionDenied, P::AuthenticationToken) => {
            "authentication token does not grant access".to_string()
        }
        _ => return None,
    };
    Some(text)
}
