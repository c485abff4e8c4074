//! Download/merge orchestrator.
//!
//! Pages through the remote change feed, merges every remote entity into
//! local storage and reports the new checkpoint. The orchestrator performs no
//! I/O: every input returns the [`SyncAction`]s the driver must execute, and
//! every reply is fed back through `on_storage_response`, `on_remote_response`
//! or `on_timer`.
//!
//! Phases of one run:
//! 1. Page the account feed until `chunk_high_usn >= update_count`
//! 2. Merge tags, saved searches, linked notebooks and notebooks
//! 3. Merge notes (notebook lookup, then full body fetch), then resources,
//!    then apply expunges
//! 4. Obtain a token per linked notebook and page each shared feed
//! 5. Merge shared content the same way
//! 6. Report `Finished` and reset

mod linked;
mod notes;
mod resolve;
mod run_state;

use crate::action::{RemoteCall, RemotePayload, RemoteRequest, RemoteResponse, SyncAction, TimerId};
use crate::config::{ConfigError, SyncConfig};
use crate::entity::{Entity, SyncEntity};
use crate::events::{LinkedSyncProgress, SyncEvent};
use crate::fault::{ErrorKind, RemoteError};
use crate::storage::{StorageOp, StoragePayload, StorageRequest, StorageResponse};
use crate::types::{
    Clock, Guid, LocalId, RequestId, SyncChunk, SyncChunkFilter, SystemClock, Timestamp, Usn,
};
use resolve::{as_new, resolve, Resolution, ResolveContext};
use run_state::{Input, MergeJob, MergeStep, RemoteStep, RunState, Scope, StorageStep, TimerPurpose};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where to resume pulling from: the account's last update count and each
/// linked notebook's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncCheckpoint {
    pub after_usn: Usn,
    pub linked_after_usn: BTreeMap<Guid, Usn>,
    pub last_sync_time: Timestamp,
}

impl SyncCheckpoint {
    pub fn new(after_usn: Usn) -> Self {
        Self {
            after_usn,
            ..Default::default()
        }
    }

    /// Checkpoint reached by a `Finished` event; `None` for any other event.
    pub fn advanced_by(&self, event: &SyncEvent) -> Option<SyncCheckpoint> {
        let SyncEvent::Finished {
            last_update_count,
            last_sync_time,
            linked_notebooks,
        } = event
        else {
            return None;
        };
        let mut next = self.clone();
        next.after_usn = *last_update_count;
        next.last_sync_time = *last_sync_time;
        for (guid, progress) in linked_notebooks {
            next.linked_after_usn.insert(guid.clone(), progress.update_count);
        }
        Some(next)
    }
}

/// Authentication for one linked notebook's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedNotebookAuth {
    pub token: String,
    /// Absent for tokens that do not expire.
    pub expires_ms: Option<Timestamp>,
}

impl LinkedNotebookAuth {
    pub fn is_valid_at(&self, now_ms: Timestamp) -> bool {
        self.expires_ms.is_none_or(|expires| expires > now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    DownloadingChunks,
    MergingTagsSearchesNotebooksLinked,
    MergingNotes,
    DownloadingLinkedNotebookChunks,
    MergingLinkedNotebookContent,
    Finalizing,
}

pub struct DownloadOrchestrator {
    config: SyncConfig,
    clock: Box<dyn Clock>,
    state: SyncState,
    paused: bool,
    pending_authentication: bool,
    stopping: bool,
    run: RunState,
    /// Survives `clear`: tokens stay valid across runs.
    linked_tokens: HashMap<Guid, LinkedNotebookAuth>,
    next_timer: u64,
    outbox: Vec<SyncAction>,
}

impl DownloadOrchestrator {
    pub fn new(config: SyncConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, SystemClock)
    }

    pub fn with_clock(
        config: SyncConfig,
        clock: impl Clock + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Box::new(clock),
            state: SyncState::Idle,
            paused: false,
            pending_authentication: false,
            stopping: false,
            run: RunState::new(SyncCheckpoint::default()),
            linked_tokens: HashMap::new(),
            next_timer: 0,
            outbox: Vec::new(),
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != SyncState::Idle
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_pending_authentication(&self) -> bool {
        self.pending_authentication
    }

    /// Storage and remote requests dispatched but not answered yet.
    pub fn outstanding_requests(&self) -> usize {
        self.run.outstanding()
    }

    /// Local id of the notebook the current run filed a note under.
    pub fn notebook_of(&self, note_guid: &Guid) -> Option<LocalId> {
        self.run.note_notebooks.get(note_guid).copied()
    }

    pub fn linked_notebook_token(&self, guid: &Guid) -> Option<&LinkedNotebookAuth> {
        self.linked_tokens.get(guid)
    }

    /// A cached token for the linked notebook that has not expired.
    pub fn has_valid_linked_token(&self, guid: &Guid) -> bool {
        let now_ms = self.clock.now_ms();
        self.linked_tokens.get(guid).is_some_and(|auth| auth.is_valid_at(now_ms))
    }

    /// Start a pull of the account from `after_usn` (0 for a full sync).
    pub fn start(&mut self, after_usn: Usn) -> Vec<SyncAction> {
        self.start_from(SyncCheckpoint::new(after_usn))
    }

    /// Start a pull from a stored checkpoint.
    pub fn start_from(&mut self, checkpoint: SyncCheckpoint) -> Vec<SyncAction> {
        if self.is_active() {
            warn!(state = ?self.state, "start requested during an active run, discarding it");
            self.reset();
        }
        self.run = RunState::new(checkpoint);
        info!(
            after_usn = self.run.checkpoint.after_usn,
            mode = ?self.run.mode,
            "starting download"
        );
        self.enter(SyncState::DownloadingChunks);
        self.request_chunk(Scope::Account);
        self.drain()
    }

    pub fn on_storage_response(&mut self, response: StorageResponse) -> Vec<SyncAction> {
        self.accept(Input::Storage(response));
        self.drain()
    }

    pub fn on_remote_response(&mut self, response: RemoteResponse) -> Vec<SyncAction> {
        self.accept(Input::Remote(response));
        self.drain()
    }

    pub fn on_timer(&mut self, id: TimerId) -> Vec<SyncAction> {
        if !self.run.timers.contains_key(&id) {
            debug!(timer = %id, "ignoring unknown timer");
            return self.drain();
        }
        if self.paused && !self.stopping {
            // The wait is over but nothing may be sent until resume.
            self.run.queued.push_back(Input::Timer(id));
            return self.drain();
        }
        self.fire_timer(id);
        self.check_progress();
        self.drain()
    }

    fn fire_timer(&mut self, id: TimerId) {
        let Some(purpose) = self.run.timers.remove(&id) else {
            return;
        };
        match purpose {
            TimerPurpose::RetryChunk(scope) => {
                if let Some(cursor) = self.run.cursor_mut(&scope) {
                    cursor.retry_timer = None;
                }
                debug!(?scope, "retrying sync chunk after rate limit");
                self.request_chunk(scope);
            }
            TimerPurpose::RefetchNote(job) => {
                debug!(note = %job.guid, "retrying full note after rate limit");
                self.fetch_full_note(job);
            }
        }
    }

    /// Stop processing replies until `resume`. Replies that arrive meanwhile
    /// are kept and processed on resume.
    pub fn pause(&mut self) -> Vec<SyncAction> {
        if self.is_active() && !self.paused {
            info!(state = ?self.state, "pausing download");
            self.suspend(false);
        }
        self.drain()
    }

    /// Continue a paused run where it left off, e.g. once a fresh
    /// authentication token is installed.
    pub fn resume(&mut self) -> Vec<SyncAction> {
        if !self.paused {
            return self.drain();
        }
        info!(state = ?self.state, queued = self.run.queued.len(), "resuming download");
        self.paused = false;
        self.pending_authentication = false;

        while !self.paused {
            let Some(input) = self.run.queued.pop_front() else {
                break;
            };
            self.process(input);
        }

        if !self.paused && self.is_active() {
            for job in std::mem::take(&mut self.run.awaiting_fetch) {
                self.fetch_full_note(job);
            }
            self.restart_idle_cursors();
            if self.run.awaiting_linked_tokens {
                self.run.awaiting_linked_tokens = false;
                self.start_linked_downloads();
            }
        }

        self.check_progress();
        self.drain()
    }

    /// Dispatch nothing new; emit `Stopped` once outstanding requests drain.
    pub fn stop(&mut self) -> Vec<SyncAction> {
        if !self.is_active() {
            return self.drain();
        }
        info!(
            state = ?self.state,
            outstanding = self.run.outstanding(),
            "stopping download"
        );
        self.stopping = true;
        self.cancel_timers();
        let queued: Vec<Input> = self.run.queued.drain(..).collect();
        for input in queued {
            match input {
                Input::Storage(response) => {
                    self.run.pending_storage.remove(&response.id);
                }
                Input::Remote(response) => {
                    self.run.pending_remote.remove(&response.id);
                }
                Input::Timer(_) => {}
            }
        }
        self.run.awaiting_fetch.clear();
        self.check_progress();
        self.drain()
    }

    /// Drop all working state and cancel timers. Linked notebook tokens are kept.
    pub fn clear(&mut self) -> Vec<SyncAction> {
        self.reset();
        self.drain()
    }

    /// Cache tokens for linked notebooks and continue a run waiting on them.
    pub fn on_linked_notebook_tokens(
        &mut self,
        tokens: HashMap<Guid, LinkedNotebookAuth>,
    ) -> Vec<SyncAction> {
        debug!(count = tokens.len(), "received linked notebook tokens");
        self.linked_tokens.extend(tokens);
        if self.state == SyncState::DownloadingLinkedNotebookChunks
            && self.run.awaiting_linked_tokens
        {
            if self.paused && self.pending_authentication {
                return self.resume();
            }
            if !self.paused {
                self.run.awaiting_linked_tokens = false;
                self.start_linked_downloads();
            }
        }
        self.check_progress();
        self.drain()
    }

    fn drain(&mut self) -> Vec<SyncAction> {
        std::mem::take(&mut self.outbox)
    }

    fn accept(&mut self, input: Input) {
        if !self.is_active() {
            debug!("ignoring reply received while idle");
            return;
        }
        if self.paused && !self.stopping {
            self.run.queued.push_back(input);
            return;
        }
        self.process(input);
        self.check_progress();
    }

    fn process(&mut self, input: Input) {
        match input {
            Input::Storage(response) => self.process_storage(response),
            Input::Remote(response) => self.process_remote(response),
            Input::Timer(id) => self.fire_timer(id),
        }
    }

    fn enter(&mut self, state: SyncState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "download state");
            self.state = state;
        }
    }

    fn emit(&mut self, event: SyncEvent) {
        self.outbox.push(SyncAction::Notify(event));
    }

    fn storage(&mut self, op: StorageOp, step: StorageStep) {
        let request = StorageRequest::new(op);
        self.run.pending_storage.insert(request.id, step);
        self.outbox.push(SyncAction::Storage(request));
    }

    fn remote(&mut self, request: RemoteRequest, step: RemoteStep) {
        let call = RemoteCall {
            id: RequestId::new(),
            request,
        };
        self.run.pending_remote.insert(call.id, step);
        self.outbox.push(SyncAction::Remote(call));
    }

    fn arm_timer(&mut self, delay: Duration, purpose: TimerPurpose) -> TimerId {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        self.run.timers.insert(id, purpose);
        self.outbox.push(SyncAction::ArmTimer { id, delay });
        id
    }

    fn cancel_timers(&mut self) {
        let timers: Vec<(TimerId, TimerPurpose)> = self.run.timers.drain().collect();
        for (id, purpose) in timers {
            if let TimerPurpose::RetryChunk(scope) = &purpose {
                if let Some(cursor) = self.run.cursor_mut(scope) {
                    cursor.retry_timer = None;
                }
            }
            self.outbox.push(SyncAction::CancelTimer(id));
        }
    }

    fn reset(&mut self) {
        self.cancel_timers();
        self.run = RunState::new(SyncCheckpoint::default());
        self.paused = false;
        self.pending_authentication = false;
        self.stopping = false;
        self.enter(SyncState::Idle);
    }

    /// Pause. Rate-limit timers stay armed; one that fires while paused is
    /// queued and acted on after resume.
    fn suspend(&mut self, pending_authentication: bool) {
        self.paused = true;
        self.pending_authentication = pending_authentication;
        self.emit(SyncEvent::Paused {
            pending_authentication,
        });
    }

    fn pause_for_authentication(&mut self) {
        if self.paused && self.pending_authentication {
            return;
        }
        warn!("authentication token expired, pausing download");
        self.suspend(true);
        self.emit(SyncEvent::RequestAuthenticationToken);
    }

    fn fail(&mut self, description: String) {
        error!("{}", description);
        self.emit(SyncEvent::Failure { description });
        self.reset();
    }

    fn fail_internal(&mut self, description: String) {
        error!(critical = true, "{}", description);
        self.emit(SyncEvent::Failure { description });
        self.reset();
    }

    fn fail_remote(&mut self, err: RemoteError) {
        if err.kind == ErrorKind::InternalInconsistency {
            self.fail_internal(err.description);
        } else {
            self.fail(err.description);
        }
    }

    fn check_progress(&mut self) {
        if !self.is_active() {
            return;
        }
        if self.stopping {
            if self.run.outstanding() == 0 {
                info!("download stopped");
                self.emit(SyncEvent::Stopped);
                self.reset();
            }
            return;
        }
        while !self.paused && self.is_merging() && self.run.step_drained() {
            self.advance_step();
        }
    }

    fn is_merging(&self) -> bool {
        matches!(
            self.state,
            SyncState::MergingTagsSearchesNotebooksLinked
                | SyncState::MergingNotes
                | SyncState::MergingLinkedNotebookContent
        )
    }

    fn restart_idle_cursors(&mut self) {
        match self.state {
            SyncState::DownloadingChunks if self.run.account.is_idle() => {
                self.request_chunk(Scope::Account)
            }
            SyncState::DownloadingLinkedNotebookChunks if !self.run.awaiting_linked_tokens => {
                let idle: Vec<Scope> = self
                    .run
                    .linked
                    .iter()
                    .filter(|(_, scope)| scope.cursor.is_idle())
                    .map(|(guid, _)| Scope::Linked(guid.clone()))
                    .collect();
                for scope in idle {
                    self.request_chunk(scope);
                }
            }
            _ => {}
        }
    }

    fn request_chunk(&mut self, scope: Scope) {
        if self.paused || self.stopping {
            return;
        }
        let max_entries = self.config.max_entries_per_chunk;
        let request = match &scope {
            Scope::Account => RemoteRequest::SyncChunk {
                after_usn: self.run.account.after_usn,
                max_entries,
                filter: SyncChunkFilter::for_mode(self.run.mode),
            },
            Scope::Linked(guid) => {
                let Some(linked) = self.run.linked.get(guid) else {
                    return;
                };
                let Some(auth) = self.linked_tokens.get(guid) else {
                    self.request_linked_tokens();
                    return;
                };
                RemoteRequest::LinkedNotebookSyncChunk {
                    linked_notebook: linked.notebook.clone(),
                    after_usn: linked.cursor.after_usn,
                    max_entries,
                    auth_token: auth.token.clone(),
                    full_sync_only: linked.cursor.after_usn == 0,
                }
            }
        };
        if let Some(cursor) = self.run.cursor_mut(&scope) {
            cursor.in_flight = true;
        }
        self.remote(request, RemoteStep::Chunk(scope));
    }

    fn process_remote(&mut self, response: RemoteResponse) {
        let Some(step) = self.run.pending_remote.remove(&response.id) else {
            debug!(request = %response.id, "ignoring reply to unknown remote request");
            return;
        };
        if let RemoteStep::Chunk(scope) = &step {
            if let Some(cursor) = self.run.cursor_mut(scope) {
                cursor.in_flight = false;
            }
        }
        if self.stopping {
            return;
        }
        match step {
            RemoteStep::Chunk(scope) => self.on_chunk(scope, response.result),
            RemoteStep::FullNote(job) => self.on_full_note(job, response.result),
        }
    }

    fn on_chunk(&mut self, scope: Scope, result: Result<RemotePayload, RemoteError>) {
        let chunk = match result {
            Ok(RemotePayload::SyncChunk(chunk)) => chunk,
            Ok(RemotePayload::Note(_)) => {
                self.fail_internal(
                    "Failed to download sync chunk: received a note instead".to_string(),
                );
                return;
            }
            Err(err) => {
                self.on_chunk_error(scope, err);
                return;
            }
        };

        let Some(cursor) = self.run.cursor_mut(&scope) else {
            return;
        };
        if let Err(description) = validate_chunk(&chunk, cursor.after_usn) {
            self.fail_internal(description);
            return;
        }

        cursor.pages += 1;
        cursor.update_count = cursor.update_count.max(chunk.update_count);
        cursor.sync_time = cursor.sync_time.max(chunk.current_time);
        if let Some(high) = chunk.chunk_high_usn {
            cursor.after_usn = high;
        }
        cursor.done = chunk.reaches_head();
        let done = cursor.done;
        debug!(
            ?scope,
            after_usn = cursor.after_usn,
            update_count = chunk.update_count,
            entities = chunk.entity_count(),
            "sync chunk downloaded"
        );

        let linked_guid = match &scope {
            Scope::Linked(guid) => Some(guid.clone()),
            Scope::Account => None,
        };
        self.run.accumulated.absorb(chunk, linked_guid.as_ref());

        if done {
            self.check_downloads_complete();
        } else {
            self.request_chunk(scope);
        }
    }

    fn on_chunk_error(&mut self, scope: Scope, err: RemoteError) {
        match err.kind {
            ErrorKind::RateLimitReached => match err.retry_after {
                Some(delay) => {
                    warn!(
                        ?scope,
                        seconds = delay.as_secs(),
                        "rate limited, retrying sync chunk later"
                    );
                    let id = self.arm_timer(delay, TimerPurpose::RetryChunk(scope.clone()));
                    if let Some(cursor) = self.run.cursor_mut(&scope) {
                        cursor.retry_timer = Some(id);
                    }
                    self.emit(SyncEvent::RateLimitExceeded {
                        seconds: delay.as_secs(),
                    });
                }
                None => self.fail_internal(err.description),
            },
            ErrorKind::AuthExpired => match scope {
                Scope::Account => self.pause_for_authentication(),
                Scope::Linked(guid) => {
                    warn!(
                        linked_notebook = %guid,
                        "linked notebook token expired, pausing download"
                    );
                    self.linked_tokens.remove(&guid);
                    self.suspend(true);
                    self.request_linked_tokens();
                }
            },
            _ => self.fail_remote(err),
        }
    }

    fn check_downloads_complete(&mut self) {
        match self.state {
            SyncState::DownloadingChunks if self.run.account.done => {
                info!(
                    pages = self.run.account.pages,
                    entities = self.run.accumulated.len(),
                    update_count = self.run.account.update_count,
                    "account sync chunks downloaded"
                );
                self.emit(SyncEvent::SyncChunksDownloaded);
                self.run.linked_phase = false;
                self.begin_step(MergeStep::Containers);
            }
            SyncState::DownloadingLinkedNotebookChunks
                if !self.run.awaiting_linked_tokens
                    && self.run.linked.values().all(|s| s.cursor.done) =>
            {
                info!(
                    linked_notebooks = self.run.linked.len(),
                    entities = self.run.accumulated.len(),
                    "linked notebook sync chunks downloaded"
                );
                self.emit(SyncEvent::LinkedNotebooksSyncChunksDownloaded);
                self.run.linked_phase = true;
                self.begin_step(MergeStep::Containers);
            }
            _ => {}
        }
    }

    fn begin_step(&mut self, step: MergeStep) {
        self.run.step = Some(step);
        let state = match (self.run.linked_phase, step) {
            (true, _) => SyncState::MergingLinkedNotebookContent,
            (false, MergeStep::Containers) => SyncState::MergingTagsSearchesNotebooksLinked,
            (false, _) => SyncState::MergingNotes,
        };
        self.enter(state);

        if step == MergeStep::Expunge {
            for (kind, guid) in self.run.accumulated.take_expunged() {
                debug!(%kind, %guid, "expunging locally");
                self.storage(
                    StorageOp::Expunge {
                        kind,
                        guid: guid.clone(),
                    },
                    StorageStep::Expunge { kind, guid },
                );
            }
            return;
        }

        let entities = self.run.accumulated.take(step.kinds());
        debug!(?step, count = entities.len(), "merging");
        for remote in entities {
            self.merge_entity(remote);
        }
    }

    fn advance_step(&mut self) {
        let finished = self.run.step;
        if finished == Some(MergeStep::Notes) {
            self.emit(SyncEvent::FullNotesContentsDownloaded);
        }
        match finished.and_then(MergeStep::next) {
            Some(next) => self.begin_step(next),
            None => {
                self.run.step = None;
                if self.run.linked_phase {
                    self.finalize();
                } else {
                    self.start_linked_phase();
                }
            }
        }
    }

    fn finalize(&mut self) {
        self.enter(SyncState::Finalizing);
        let linked_notebooks: BTreeMap<Guid, LinkedSyncProgress> = self
            .run
            .linked
            .iter()
            .map(|(guid, scope)| {
                (
                    guid.clone(),
                    LinkedSyncProgress {
                        update_count: scope.cursor.update_count,
                        sync_time: scope.cursor.sync_time,
                    },
                )
            })
            .collect();
        let last_update_count = self.run.account.update_count;
        let last_sync_time = self.run.account.sync_time;
        info!(
            last_update_count,
            last_sync_time,
            linked_notebooks = linked_notebooks.len(),
            "download finished"
        );
        self.emit(SyncEvent::Finished {
            last_update_count,
            last_sync_time,
            linked_notebooks,
        });
        self.reset();
    }

    /// Start resolving one remote entity: by guid, then by name, else new.
    fn merge_entity(&mut self, remote: Entity) {
        let query = remote.clone();
        self.storage(StorageOp::FindByGuid(query), StorageStep::FindByGuid(remote));
    }

    fn process_storage(&mut self, response: StorageResponse) {
        let Some(step) = self.run.pending_storage.remove(&response.id) else {
            debug!(request = %response.id, "ignoring reply to unknown storage request");
            return;
        };
        if self.stopping {
            return;
        }
        match step {
            StorageStep::FindByGuid(remote) => match response.result {
                Ok(StoragePayload::Entity(local)) => self.proceed(remote, Some(local)),
                Ok(_) => self.fail_internal(format!(
                    "Local storage answered find by guid of {} with a collection",
                    remote.describe()
                )),
                Err(_) if remote.display_key().is_none() => self.proceed(remote, None),
                Err(_) => {
                    let query = remote.clone();
                    self.storage(StorageOp::FindByName(query), StorageStep::FindByName(remote));
                }
            },
            StorageStep::FindByName(remote) => match response.result {
                Ok(StoragePayload::Entity(local)) => {
                    if local.guid().is_some() && local.guid() != remote.guid() {
                        debug!(
                            remote = %remote.describe(),
                            local = %local.describe(),
                            "name matches an entity with another guid, adding as new"
                        );
                        self.proceed(remote, None);
                    } else if !self.run.claimed_by_name.insert(local.local_id()) {
                        debug!(
                            remote = %remote.describe(),
                            local = %local.describe(),
                            "name match already taken by another remote entity, adding as new"
                        );
                        self.proceed(remote, None);
                    } else {
                        self.proceed(remote, Some(local));
                    }
                }
                Ok(_) => self.fail_internal(format!(
                    "Local storage answered find by name of {} with a collection",
                    remote.describe()
                )),
                Err(_) => self.proceed(remote, None),
            },
            StorageStep::Parent(job) => self.on_parent(job, response.result),
            StorageStep::Write { description } => match response.result {
                Ok(_) => debug!("{} done", description),
                Err(failure) => self.fail(format!(
                    "Failed to {} in local storage: {}",
                    description, failure.description
                )),
            },
            StorageStep::ConflictRename { then_add } => match response.result {
                Ok(renamed) => {
                    if let StoragePayload::Entity(renamed) = &renamed {
                        info!(
                            renamed = %renamed.describe(),
                            "kept conflicting local copy under a new name"
                        );
                    }
                    self.write(StorageOp::Add(then_add));
                }
                Err(failure) => self.fail(format!(
                    "Failed to rename conflicting {} in local storage: {}",
                    then_add.describe(),
                    failure.description
                )),
            },
            StorageStep::Expunge { kind, guid } => match response.result {
                Ok(_) => debug!(%kind, %guid, "expunged"),
                Err(failure) => warn!(%kind, %guid, "could not expunge: {}", failure.description),
            },
            StorageStep::ListLinkedNotebooks => self.on_linked_notebooks_listed(response.result),
        }
    }

    fn proceed(&mut self, remote: Entity, local: Option<Entity>) {
        let resolution = match &local {
            Some(local) => {
                let ctx = ResolveContext {
                    now_ms: self.clock.now_ms(),
                    timestamp_format: &self.config.conflict_timestamp_format,
                };
                resolve(&remote, local, &ctx)
            }
            None => Resolution::Add(as_new(remote.clone())),
        };
        if resolution == Resolution::UpToDate {
            debug!(entity = %remote.describe(), "already up to date");
            return;
        }
        match remote.guid() {
            Some(guid) if remote.as_note().is_some() || matches!(remote, Entity::Resource(_)) => {
                let job = MergeJob {
                    guid: guid.clone(),
                    resolution,
                };
                self.resolve_parent(job);
            }
            _ => self.apply(resolution),
        }
    }

    fn apply(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::UpToDate => {}
            Resolution::Add(entity) => self.write(StorageOp::Add(entity)),
            Resolution::Overwrite(entity) => self.write(StorageOp::Update(entity)),
            Resolution::Conflict { renamed, remote } => {
                info!(
                    local = %renamed.describe(),
                    remote = %remote.describe(),
                    "conflict: local copy has unsent edits"
                );
                self.storage(
                    StorageOp::Update(renamed),
                    StorageStep::ConflictRename { then_add: remote },
                );
            }
        }
    }

    fn write(&mut self, op: StorageOp) {
        let description = match &op {
            StorageOp::Add(entity) | StorageOp::Update(entity) => {
                format!("{} {}", op.name(), entity.describe())
            }
            other => other.name().to_string(),
        };
        self.storage(op, StorageStep::Write { description });
    }
}

/// Reject pages the rest of the run cannot safely merge.
fn validate_chunk(chunk: &SyncChunk, after_usn: Usn) -> Result<(), String> {
    match chunk.chunk_high_usn {
        Some(high) if high <= after_usn => {
            return Err(format!(
                "Sync chunk high usn {} does not advance past {}",
                high, after_usn
            ));
        }
        None if chunk.entity_count() > 0 => {
            return Err("Sync chunk carries entities but no high usn".to_string());
        }
        _ => {}
    }

    let entities = chunk
        .notes
        .iter()
        .map(|e| e as &dyn SyncEntity)
        .chain(chunk.notebooks.iter().map(|e| e as &dyn SyncEntity))
        .chain(chunk.tags.iter().map(|e| e as &dyn SyncEntity))
        .chain(chunk.searches.iter().map(|e| e as &dyn SyncEntity))
        .chain(chunk.resources.iter().map(|e| e as &dyn SyncEntity))
        .chain(chunk.linked_notebooks.iter().map(|e| e as &dyn SyncEntity));

    for entity in entities {
        let name = entity.display_key().unwrap_or("");
        match entity.guid() {
            Some(guid) if guid.is_well_formed() => {}
            Some(guid) => {
                return Err(format!(
                    "Remote {} \"{}\" has malformed guid {:?}",
                    entity.kind(),
                    name,
                    guid.as_str()
                ));
            }
            None => return Err(format!("Remote {} \"{}\" has no guid", entity.kind(), name)),
        }
        if entity.usn().is_none() {
            return Err(format!(
                "Remote {} \"{}\" has no update sequence number",
                entity.kind(),
                name
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
