//! Local storage as a separate task reached only by message passing.

use anyhow::{anyhow, Result};
use note_sync_core::{InMemoryStorage, StorageRequest, StorageResponse};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Handle to the storage task. Every request sent is answered on
/// [`StorageWorker::recv`] with the same request id.
pub struct StorageWorker {
    request_tx: Option<mpsc::UnboundedSender<StorageRequest>>,
    response_rx: mpsc::UnboundedReceiver<StorageResponse>,
    task: JoinHandle<InMemoryStorage>,
}

impl StorageWorker {
    pub fn spawn(mut storage: InMemoryStorage) -> Self {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<StorageRequest>();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            debug!(entities = storage.len(), "storage worker started");
            while let Some(request) = request_rx.recv().await {
                trace!(request = %request.id, op = request.op.name(), "storage request");
                let response = storage.handle(request);
                if response_tx.send(response).is_err() {
                    // Driver gone
                    break;
                }
            }
            debug!(entities = storage.len(), "storage worker stopped");
            storage
        });

        Self {
            request_tx: Some(request_tx),
            response_rx,
            task,
        }
    }

    pub fn send(&self, request: StorageRequest) -> Result<()> {
        let tx = self
            .request_tx
            .as_ref()
            .ok_or_else(|| anyhow!("storage worker is shut down"))?;
        tx.send(request).map_err(|_| anyhow!("storage worker stopped unexpectedly"))
    }

    pub async fn recv(&mut self) -> Option<StorageResponse> {
        self.response_rx.recv().await
    }

    /// Stop the worker and take back the store.
    pub async fn shutdown(mut self) -> Result<InMemoryStorage> {
        self.request_tx.take();
        Ok(self.task.await?)
    }
}
