//! Write serializer: the single task that mutates the snapshot.
//!
//! Requests arrive over an unbounded MPSC channel and are applied one at a
//! time in channel order, each under its own write-lock critical section.
//! The same task runs checkpoints, so a checkpoint pauses writes but never
//! interleaves with one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use pushgate_core::WriteRequest;

use crate::error::{PersistError, PersistResult, StoreResult};
use crate::persist::{encode_snapshot, Persistor};
use crate::store::{Shared, StoreState};

/// Upper bound on messages handled before the checkpoint deadline is
/// looked at again.
const MAX_BATCH: usize = 1024;

/// Delay before retrying a failed checkpoint.
const CHECKPOINT_RETRY: Duration = Duration::from_secs(5);

/// Messages accepted by the writer task.
#[derive(Debug)]
pub(crate) enum Message {
    Write(WriteRequest),
    /// Answered once every earlier message has been handled.
    Flush(oneshot::Sender<()>),
    /// Drain, write a final checkpoint, exit.
    Shutdown,
}

/// Checkpoint target and the delay between a change and its checkpoint.
#[derive(Debug, Clone)]
pub(crate) struct Checkpointing {
    pub(crate) persistor: Persistor,
    pub(crate) interval: Duration,
}

pub(crate) struct Writer {
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    checkpointing: Option<Checkpointing>,
    /// When the pending checkpoint is due; `None` when nothing is unpersisted.
    deadline: Option<Instant>,
    /// Set once the shutdown drain has applied everything queued. Dropped
    /// with the writer, which also releases waiters if the task dies.
    drained: watch::Sender<bool>,
}

impl Writer {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Message>,
        shared: Arc<Shared>,
        checkpointing: Option<Checkpointing>,
        drained: watch::Sender<bool>,
    ) -> Self {
        Self {
            rx,
            shared,
            checkpointing,
            deadline: None,
            drained,
        }
    }

    /// Process messages until shutdown or until every sender is gone, then
    /// drain and persist.
    pub(crate) async fn run(mut self) -> StoreResult<()> {
        info!(
            persistence = self.checkpointing.is_some(),
            "metric store writer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = wait_until(self.deadline) => {
                    self.deadline = None;
                    if let Err(e) = self.checkpoint().await {
                        error!(error = %e, retry_secs = CHECKPOINT_RETRY.as_secs(),
                            "checkpoint failed, data stays unpersisted until retry");
                        self.deadline = Some(Instant::now() + CHECKPOINT_RETRY);
                    }
                }
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        debug!("all store handles dropped");
                        break;
                    };
                    if !self.handle_batch(msg).await {
                        break;
                    }
                }
            }
        }

        self.finish().await
    }

    /// Handle `first` plus whatever is already queued behind it.
    /// Returns false once a shutdown message is seen.
    async fn handle_batch(&mut self, first: Message) -> bool {
        let mut changed = false;
        let mut handled = 0;
        let mut next = Some(first);

        while let Some(msg) = next.take() {
            match msg {
                Message::Write(req) => changed |= self.apply(req).await,
                Message::Flush(done) => {
                    let _ = done.send(());
                }
                Message::Shutdown => return false,
            }
            handled += 1;
            if handled < MAX_BATCH {
                next = self.rx.try_recv().ok();
            }
        }

        if changed {
            self.arm();
        }
        true
    }

    async fn apply(&self, req: WriteRequest) -> bool {
        self.shared.metrics.record_dequeued();
        let outcome = self.shared.snapshot.write().await.apply(req);
        self.shared.metrics.record_apply(&outcome);
        outcome.changed
    }

    /// Schedule a checkpoint unless one is already pending.
    fn arm(&mut self) {
        if let Some(checkpointing) = &self.checkpointing {
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + checkpointing.interval);
            }
        }
    }

    async fn checkpoint(&self) -> PersistResult<()> {
        let Some(checkpointing) = &self.checkpointing else {
            return Ok(());
        };
        let result = self.write_checkpoint(checkpointing).await;
        self.shared.metrics.record_checkpoint(result.is_ok());
        result
    }

    async fn write_checkpoint(&self, checkpointing: &Checkpointing) -> PersistResult<()> {
        let (bytes, families) = {
            let snapshot = self.shared.snapshot.read().await;
            (encode_snapshot(&snapshot)?, snapshot.len())
        };
        let len = bytes.len();
        let persistor = checkpointing.persistor.clone();
        tokio::task::spawn_blocking(move || persistor.write_encoded(&bytes))
            .await
            .map_err(|e| PersistError::Io(std::io::Error::other(e.to_string())))??;
        info!(families, bytes = len, "checkpoint complete");
        Ok(())
    }

    async fn finish(mut self) -> StoreResult<()> {
        self.shared.set_state(StoreState::Draining);
        self.rx.close();

        let mut drained = 0usize;
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Message::Write(req) => {
                    self.apply(req).await;
                    drained += 1;
                }
                Message::Flush(done) => {
                    let _ = done.send(());
                }
                Message::Shutdown => {}
            }
        }
        debug!(drained, "write queue drained");
        self.drained.send_replace(true);

        self.shared.set_state(StoreState::Persisting);
        if self.checkpointing.is_some() {
            if let Err(e) = self.checkpoint().await {
                error!(error = %e, "final checkpoint failed");
                return Err(e.into());
            }
        }

        info!("metric store writer stopped");
        Ok(())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
