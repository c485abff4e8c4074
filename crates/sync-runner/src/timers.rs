//! One-shot delayed callbacks as abortable tokio tasks.

use note_sync_core::TimerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct TimerScheduler {
    tasks: HashMap<TimerId, JoinHandle<()>>,
    fired_tx: mpsc::UnboundedSender<TimerId>,
    fired_rx: mpsc::UnboundedReceiver<TimerId>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        Self {
            tasks: HashMap::new(),
            fired_tx,
            fired_rx,
        }
    }

    pub fn arm(&mut self, id: TimerId, delay: Duration) {
        debug!(timer = %id, delay_ms = delay.as_millis() as u64, "arming timer");
        let tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        });
        if let Some(previous) = self.tasks.insert(id, task) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(task) = self.tasks.remove(&id) {
            debug!(timer = %id, "cancelling timer");
            task.abort();
        }
    }

    pub fn armed(&self) -> usize {
        self.tasks.len()
    }

    /// Next timer to fire. Timers cancelled after firing but before being
    /// received are skipped.
    pub async fn fired(&mut self) -> Option<TimerId> {
        loop {
            let id = self.fired_rx.recv().await?;
            if self.tasks.remove(&id).is_some() {
                return Some(id);
            }
        }
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}
