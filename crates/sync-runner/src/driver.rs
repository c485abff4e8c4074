//! Drives the download orchestrator and the local change uploader.
//!
//! The state machines only return actions. The driver executes them: storage
//! requests go to the storage worker, remote calls run concurrently, timers
//! are tokio tasks, and notifications are published on the event bus and
//! answered where the runner can (authentication, next phase).

use crate::config::AuthConfig;
use crate::storage_worker::StorageWorker;
use crate::timers::TimerScheduler;
use anyhow::{bail, Result};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use note_sync_core::types::RequestId;
use note_sync_core::{
    DownloadOrchestrator, EventBus, Guid, InMemoryStorage, LinkedNotebookAuth, LocalChangeUploader,
    LocalChanges, NoteService, RemoteNoteClient, RemoteResponse, StorageResponse, SyncAction,
    SyncCheckpoint, SyncConfig, SyncEvent,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Pull finished and local changes were collected.
    Completed {
        checkpoint: SyncCheckpoint,
        local_changes: LocalChanges,
    },
    Failed { description: String },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Download,
    Upload,
}

pub struct SyncDriver<S: NoteService + 'static> {
    orchestrator: DownloadOrchestrator,
    uploader: LocalChangeUploader,
    client: Arc<RemoteNoteClient<S>>,
    storage: StorageWorker,
    timers: TimerScheduler,
    in_flight: FuturesUnordered<BoxFuture<'static, RemoteResponse>>,
    upload_requests: HashSet<RequestId>,
    auth: AuthConfig,
    bus: Arc<EventBus>,
    checkpoint: SyncCheckpoint,
    reauthenticated: bool,
    linked_served: HashSet<Guid>,
    outcome: Option<SyncOutcome>,
}

impl<S: NoteService + 'static> SyncDriver<S> {
    /// Must be called within a tokio runtime: the storage worker is spawned here.
    pub fn new(
        config: SyncConfig,
        client: RemoteNoteClient<S>,
        storage: InMemoryStorage,
        auth: AuthConfig,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let orchestrator = DownloadOrchestrator::new(config)?;
        Ok(Self {
            orchestrator,
            uploader: LocalChangeUploader::new(),
            client: Arc::new(client),
            storage: StorageWorker::spawn(storage),
            timers: TimerScheduler::new(),
            in_flight: FuturesUnordered::new(),
            upload_requests: HashSet::new(),
            auth,
            bus,
            checkpoint: SyncCheckpoint::default(),
            reauthenticated: false,
            linked_served: HashSet::new(),
            outcome: None,
        })
    }

    pub fn client(&self) -> &RemoteNoteClient<S> {
        &self.client
    }

    /// Pull from `checkpoint`, then collect local changes. Resolving
    /// `shutdown` stops the run cooperatively.
    pub async fn run(
        &mut self,
        checkpoint: SyncCheckpoint,
        shutdown: impl Future<Output = ()>,
    ) -> Result<SyncOutcome> {
        tokio::pin!(shutdown);
        let mut stop_requested = false;
        self.checkpoint = checkpoint.clone();
        self.reauthenticated = false;
        self.linked_served.clear();
        self.outcome = None;

        info!(after_usn = checkpoint.after_usn, "starting sync run");
        let actions = self.orchestrator.start_from(checkpoint);
        self.dispatch(Owner::Download, actions)?;

        loop {
            if let Some(outcome) = self.outcome.take() {
                return Ok(outcome);
            }
            tokio::select! {
                Some(response) = self.storage.recv() => {
                    self.on_storage_response(response)?;
                }
                Some(response) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    let actions = self.orchestrator.on_remote_response(response);
                    self.dispatch(Owner::Download, actions)?;
                }
                Some(id) = self.timers.fired() => {
                    let actions = self.orchestrator.on_timer(id);
                    self.dispatch(Owner::Download, actions)?;
                }
                _ = &mut shutdown, if !stop_requested => {
                    info!("Shutdown requested, stopping sync");
                    stop_requested = true;
                    self.stop()?;
                }
                else => bail!("sync driver has nothing left to wait on"),
            }
        }
    }

    /// Stop the store worker and take back the local store.
    pub async fn into_storage(self) -> Result<InMemoryStorage> {
        self.storage.shutdown().await
    }

    fn stop(&mut self) -> Result<()> {
        if self.uploader.is_active() {
            self.uploader.clear();
            self.upload_requests.clear();
            self.outcome = Some(SyncOutcome::Stopped);
            return Ok(());
        }
        let actions = self.orchestrator.stop();
        self.dispatch(Owner::Download, actions)
    }

    fn on_storage_response(&mut self, response: StorageResponse) -> Result<()> {
        if self.upload_requests.remove(&response.id) {
            let actions = self.uploader.on_storage_response(response);
            self.dispatch(Owner::Upload, actions)
        } else {
            let actions = self.orchestrator.on_storage_response(response);
            self.dispatch(Owner::Download, actions)
        }
    }

    fn dispatch(&mut self, owner: Owner, actions: Vec<SyncAction>) -> Result<()> {
        for action in actions {
            match action {
                SyncAction::Storage(request) => {
                    if owner == Owner::Upload {
                        self.upload_requests.insert(request.id);
                    }
                    self.storage.send(request)?;
                }
                SyncAction::Remote(call) => {
                    let client = Arc::clone(&self.client);
                    self.in_flight.push(async move { client.execute(call).await }.boxed());
                }
                SyncAction::ArmTimer { id, delay } => self.timers.arm(id, delay),
                SyncAction::CancelTimer(id) => self.timers.cancel(id),
                SyncAction::Notify(event) => {
                    self.bus.emit(&event);
                    self.on_event(event)?;
                }
            }
        }
        Ok(())
    }

    fn on_event(&mut self, event: SyncEvent) -> Result<()> {
        match event {
            SyncEvent::RequestAuthenticationToken => {
                if self.reauthenticated {
                    error!("Configured authentication token was rejected");
                    self.abandon(
                        "Authentication token expired and no fresh token is available".to_string(),
                    )
                } else {
                    info!("Installing configured authentication token");
                    self.reauthenticated = true;
                    self.client.set_auth_token(self.auth.token.clone());
                    let actions = self.orchestrator.resume();
                    self.dispatch(Owner::Download, actions)
                }
            }
            SyncEvent::RequestLinkedNotebookTokens { notebooks } => {
                let mut tokens: HashMap<Guid, LinkedNotebookAuth> = HashMap::new();
                for notebook in &notebooks {
                    // Still cached and unexpired: nothing to hand over.
                    if self.orchestrator.has_valid_linked_token(&notebook.guid) {
                        continue;
                    }
                    // Asked again after being served: the configured token was rejected.
                    if self.linked_served.contains(&notebook.guid) {
                        let description = format!(
                            "Configured token for linked notebook {} was rejected",
                            notebook.guid
                        );
                        return self.abandon(description);
                    }
                    match self.auth.linked_notebooks.get(&notebook.guid) {
                        Some(auth) => {
                            tokens.insert(notebook.guid.clone(), auth.clone());
                        }
                        None => {
                            return self.abandon(format!(
                                "No authentication token configured for linked notebook {}",
                                notebook.guid
                            ));
                        }
                    }
                }
                self.linked_served.extend(tokens.keys().cloned());
                let actions = self.orchestrator.on_linked_notebook_tokens(tokens);
                self.dispatch(Owner::Download, actions)
            }
            SyncEvent::Finished { .. } => {
                if let Some(next) = self.checkpoint.advanced_by(&event) {
                    self.checkpoint = next;
                }
                info!(
                    after_usn = self.checkpoint.after_usn,
                    "download finished, collecting local changes"
                );
                let actions = self.uploader.start();
                self.dispatch(Owner::Upload, actions)
            }
            SyncEvent::LocalChangesCollected { changes } => {
                self.outcome = Some(SyncOutcome::Completed {
                    checkpoint: self.checkpoint.clone(),
                    local_changes: changes,
                });
                Ok(())
            }
            SyncEvent::Failure { description } => {
                self.outcome = Some(SyncOutcome::Failed { description });
                Ok(())
            }
            SyncEvent::Stopped => {
                self.outcome = Some(SyncOutcome::Stopped);
                Ok(())
            }
            other => {
                debug!(event = ?other, "sync progress");
                Ok(())
            }
        }
    }

    /// End the run with a failure the engine itself did not report.
    fn abandon(&mut self, description: String) -> Result<()> {
        let actions = self.orchestrator.clear();
        self.dispatch(Owner::Download, actions)?;
        let event = SyncEvent::Failure { description };
        self.bus.emit(&event);
        self.on_event(event)
    }
}
