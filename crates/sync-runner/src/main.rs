//! note-sync: pulls a note account into the local store and reports the
//! local changes waiting to be sent.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use note_sync_core::{EventBus, RemoteNoteClient, SyncEvent};
use note_sync_runner::{fixture, PersistedState, RunnerConfig, StateStore, SyncDriver, SyncOutcome};

#[derive(Parser, Debug)]
#[command(name = "note-sync")]
#[command(about = "Download and merge a note account into the local store")]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the local store (overrides the config)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// JSON account snapshot to sync from (overrides the config)
    #[arg(short, long)]
    remote: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Failure { description } => error!("Sync failed: {}", description),
        SyncEvent::Finished { last_update_count, .. } => {
            info!("Download finished at update count {}", last_update_count)
        }
        SyncEvent::RateLimitExceeded { seconds } => {
            warn!("Rate limit exceeded, waiting {}s", seconds)
        }
        SyncEvent::Paused { pending_authentication } => {
            info!("Sync paused (pending authentication: {})", pending_authentication)
        }
        SyncEvent::Stopped => info!("Sync stopped"),
        SyncEvent::SyncChunksDownloaded => info!("Account sync chunks downloaded"),
        SyncEvent::LinkedNotebooksSyncChunksDownloaded => {
            info!("Linked notebook sync chunks downloaded")
        }
        SyncEvent::FullNotesContentsDownloaded => info!("Note contents downloaded"),
        other => debug!(event = ?other, "sync event"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,note_sync_runner=debug,note_sync_core=debug"
    } else {
        "info,note_sync_runner=info,note_sync_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting note-sync");

    let mut config = match &args.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };
    if let Some(store) = args.store {
        config.store_path = Some(store);
    }
    if let Some(remote) = args.remote {
        config.remote_fixture = Some(remote);
    }

    let Some(fixture_path) = config.remote_fixture.clone() else {
        bail!("No remote account given; pass --remote or set remote_fixture in the config");
    };
    let service = fixture::load_service(&fixture_path)?;
    info!("Remote account: {:?}", fixture_path);

    let store_dir = config.store_path.clone().unwrap_or_else(|| PathBuf::from("."));
    let state_store = StateStore::new(&store_dir);
    let PersistedState { checkpoint, storage } = state_store.load()?;
    info!(
        "Local store: {:?} ({} entities, after update count {})",
        store_dir,
        storage.len(),
        checkpoint.after_usn
    );

    let bus = Arc::new(EventBus::new());
    let _subscription = bus.subscribe(log_event);

    let client = RemoteNoteClient::new(service, config.auth.token.clone());
    let mut driver = SyncDriver::new(
        config.sync.clone(),
        client,
        storage,
        config.auth.clone(),
        Arc::clone(&bus),
    )
    .context("Failed to set up sync")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let outcome = driver.run(checkpoint, shutdown).await?;
    let storage = driver.into_storage().await?;

    match outcome {
        SyncOutcome::Completed { checkpoint, local_changes } => {
            state_store.save(&PersistedState { checkpoint, storage })?;
            info!("Saved local store to {:?}", state_store.path());
            if local_changes.is_empty() {
                info!("No local changes to send");
            } else {
                info!(
                    "{} local changes to send: {} notebooks, {} tags, {} saved searches, \
                     {} notes, {} linked notebooks",
                    local_changes.len(),
                    local_changes.notebooks.len(),
                    local_changes.tags.len(),
                    local_changes.searches.len(),
                    local_changes.notes.len(),
                    local_changes.linked_notebooks.len()
                );
                println!("{}", serde_json::to_string_pretty(&local_changes)?);
            }
            Ok(())
        }
        SyncOutcome::Stopped => {
            info!("Sync stopped before completion, local store not saved");
            Ok(())
        }
        SyncOutcome::Failed { description } => bail!("Sync failed: {}", description),
    }
}
