//! MetricStore: the public facade over the writer task and the snapshot.
//!
//! Producers call [`MetricStore::submit_write_request`], which only enqueues.
//! Readers call the query methods, which copy the snapshot under the read
//! half of a lock that the writer holds for exactly one request at a time.
//! The store is `Clone`; all clones share one writer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pushgate_core::{JobToInstanceMap, MetricFamily, StoreConfig, WriteRequest};

use crate::error::{StoreError, StoreResult};
use crate::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::persist::Persistor;
use crate::snapshot::Snapshot;
use crate::writer::{Checkpointing, Message, Writer};

/// Lifecycle of a store. Only [`MetricStore::shutdown`] leaves `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreState {
    Running = 0,
    /// Shutdown requested; the writer is applying what is still queued.
    Draining = 1,
    /// Queue empty; the final checkpoint is being written.
    Persisting = 2,
    /// The writer has exited. Queries still work.
    Stopped = 3,
}

impl StoreState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StoreState::Running,
            1 => StoreState::Draining,
            2 => StoreState::Persisting,
            _ => StoreState::Stopped,
        }
    }
}

/// State shared by the facade and the writer task.
pub(crate) struct Shared {
    pub(crate) snapshot: RwLock<Snapshot>,
    pub(crate) metrics: StoreMetrics,
    state: AtomicU8,
    drained: watch::Receiver<bool>,
}

impl Shared {
    fn new(snapshot: Snapshot, drained: watch::Receiver<bool>) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            metrics: StoreMetrics::new(),
            state: AtomicU8::new(StoreState::Running as u8),
            drained,
        }
    }

    pub(crate) fn state(&self) -> StoreState {
        StoreState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StoreState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Concurrent metric store with a single serialized writer.
#[derive(Clone)]
pub struct MetricStore {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    writer: Arc<Mutex<Option<JoinHandle<StoreResult<()>>>>>,
}

impl MetricStore {
    /// Start a store that keeps everything in memory.
    ///
    /// Spawns the writer task, so this must run inside a Tokio runtime.
    pub fn in_memory() -> Self {
        info!("metric store opened in memory");
        Self::start(Snapshot::new(), None)
    }

    /// Restore the checkpoint at `path` (if any) and start a store that
    /// checkpoints to it `interval` after each change.
    ///
    /// A missing checkpoint starts an empty store; an unreadable or corrupt
    /// one is an error. Must run inside a Tokio runtime.
    pub fn open(path: impl Into<PathBuf>, interval: Duration) -> StoreResult<Self> {
        let persistor = Persistor::new(path);
        let snapshot = persistor.restore()?;
        info!(path = ?persistor.path(), families = snapshot.len(),
            interval_secs = interval.as_secs(), "metric store opened");
        Ok(Self::start(
            snapshot,
            Some(Checkpointing {
                persistor,
                interval,
            }),
        ))
    }

    /// Open according to a parsed `pushgate.toml`.
    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        match &config.persistence {
            None => Ok(Self::in_memory()),
            Some(persistence) => Ok(Self::open(
                persistence.file.clone(),
                persistence.interval()?,
            )?),
        }
    }

    fn start(snapshot: Snapshot, checkpointing: Option<Checkpointing>) -> Self {
        let (drained_tx, drained_rx) = watch::channel(false);
        let shared = Arc::new(Shared::new(snapshot, drained_rx));
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Writer::new(rx, Arc::clone(&shared), checkpointing, drained_tx);
        let handle = tokio::spawn(writer.run());
        Self {
            tx,
            shared,
            writer: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue a request. Never waits for the store; requests from all
    /// callers are applied in the order this method was called.
    ///
    /// After shutdown the request is logged and discarded.
    pub fn submit_write_request(&self, req: WriteRequest) {
        self.shared.metrics.record_enqueued();
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(Message::Write(req)) {
            self.shared.metrics.record_dequeued();
            if let Message::Write(req) = msg {
                warn!(job = %req.job, instance = %req.instance,
                    "write request submitted after shutdown, discarded");
            }
        }
    }

    /// Wait until every request submitted before this call has been applied.
    ///
    /// Once shutdown has closed the queue this waits for the drain instead,
    /// so it still returns only after every queued request is applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
            return;
        }
        // Err means the writer is gone without finishing the drain.
        let mut drained = self.shared.drained.clone();
        let _ = drained.wait_for(|done| *done).await;
    }

    /// All stored families, flat and unordered.
    ///
    /// The families are shared with the store and never modified by it.
    pub async fn get_metric_families(&self) -> Vec<Arc<MetricFamily>> {
        self.shared.snapshot.read().await.metric_families()
    }

    /// A copy of the job → instance → name hierarchy owned by the caller.
    pub async fn get_metric_families_map(&self) -> JobToInstanceMap {
        self.shared.snapshot.read().await.to_map()
    }

    /// Families merged by name across groups, for exposition.
    pub async fn gather_metric_families(&self) -> Vec<MetricFamily> {
        self.shared.snapshot.read().await.gather()
    }

    /// Latest push time of a (job, instance) group.
    pub async fn push_timestamp(&self, job: &str, instance: &str) -> Option<SystemTime> {
        self.shared.snapshot.read().await.push_timestamp(job, instance)
    }

    pub fn state(&self) -> StoreState {
        self.shared.state()
    }

    /// Counters describing the writer's work so far.
    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// `Ok` while the store is running and its writer task is alive.
    pub async fn healthy(&self) -> StoreResult<()> {
        if self.state() != StoreState::Running {
            return Err(StoreError::NotRunning);
        }
        match self.writer.lock().await.as_ref() {
            Some(handle) if !handle.is_finished() => Ok(()),
            _ => Err(StoreError::NotRunning),
        }
    }

    /// Drain the queue, write a final checkpoint (if persistent), and stop
    /// the writer. Blocks until all of that is done.
    ///
    /// Callers must stop submitting first; a request racing with shutdown
    /// may or may not be applied. On success the store stays readable but
    /// accepts no further writes. On error the in-memory data is still
    /// readable but was not persisted.
    pub async fn shutdown(&self) -> StoreResult<()> {
        let Some(handle) = self.writer.lock().await.take() else {
            return Err(StoreError::AlreadyShutDown);
        };
        info!("metric store shutting down");

        // Fails only if the writer already exited.
        let _ = self.tx.send(Message::Shutdown);
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::WriterPanicked(e.to_string())),
        };
        self.shared.set_state(StoreState::Stopped);

        match &result {
            Ok(()) => info!("metric store stopped"),
            Err(e) => error!(error = %e, "metric store shutdown failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pushgate_core::{Metric, MetricKind, MetricValue, INSTANCE_LABEL, JOB_LABEL};

    fn counter_family(name: &str, job: &str, instance: &str, value: f64) -> MetricFamily {
        MetricFamily::new(
            name,
            "help",
            MetricKind::Counter,
            vec![Metric::new(MetricValue::Counter { value })
                .with_label(JOB_LABEL, job)
                .with_label(INSTANCE_LABEL, instance)],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn push_then_delete_leaves_store_empty() {
        let store = MetricStore::in_memory();
        store.submit_write_request(WriteRequest::push(
            "batch",
            "",
            [counter_family("jobs_run", "batch", "", 5.0)],
        ));
        store.submit_write_request(WriteRequest::delete("batch", ""));
        store.flush().await;

        assert!(store.get_metric_families().await.is_empty());
        assert!(store.get_metric_families_map().await.is_empty());
    }

    #[tokio::test]
    async fn flush_makes_writes_visible() {
        let store = MetricStore::in_memory();
        store.submit_write_request(WriteRequest::push(
            "batch",
            "h1",
            [counter_family("jobs_run", "batch", "h1", 1.0)],
        ));
        store.flush().await;

        let map = store.get_metric_families_map().await;
        assert!(map["batch"]["h1"].contains_key("jobs_run"));
        assert!(store.push_timestamp("batch", "h1").await.is_some());
        assert_eq!(store.metrics().requests_applied, 1);
        assert_eq!(store.metrics().queue_depth, 0);
    }

    #[tokio::test]
    async fn state_walks_to_stopped() {
        let store = MetricStore::in_memory();
        assert_eq!(store.state(), StoreState::Running);
        store.healthy().await.unwrap();

        store.shutdown().await.unwrap();
        assert_eq!(store.state(), StoreState::Stopped);
        assert!(matches!(store.healthy().await, Err(StoreError::NotRunning)));
    }

    #[tokio::test]
    async fn second_shutdown_is_rejected() {
        let store = MetricStore::in_memory();
        store.shutdown().await.unwrap();
        assert!(matches!(
            store.shutdown().await,
            Err(StoreError::AlreadyShutDown)
        ));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_discarded() {
        let store = MetricStore::in_memory();
        store.shutdown().await.unwrap();

        store.submit_write_request(WriteRequest::push(
            "late",
            "",
            [counter_family("x", "late", "", 1.0)],
        ));
        store.flush().await;

        assert!(store.get_metric_families().await.is_empty());
        assert_eq!(store.metrics().queue_depth, 0);
    }

    #[tokio::test]
    async fn flush_during_drain_waits_for_queued_writes() {
        let store = MetricStore::in_memory();
        // Holding a reader stalls the drain on its first write.
        let reader = store.shared.snapshot.read().await;

        store.tx.send(Message::Shutdown).unwrap();
        for i in 0..10 {
            store.submit_write_request(WriteRequest::push(
                "batch",
                "",
                [counter_family("x", "batch", "", i as f64)],
            ));
        }
        while store.state() != StoreState::Draining {
            tokio::task::yield_now().await;
        }

        let flusher = tokio::spawn({
            let store = store.clone();
            async move { store.flush().await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!flusher.is_finished());

        drop(reader);
        flusher.await.unwrap();
        assert_eq!(store.metrics().requests_applied, 10);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_one_writer() {
        let store = MetricStore::in_memory();
        let producer = store.clone();
        producer.submit_write_request(WriteRequest::push(
            "batch",
            "",
            [counter_family("x", "batch", "", 1.0)],
        ));
        store.shutdown().await.unwrap();

        assert_eq!(producer.get_metric_families().await.len(), 1);
        assert_eq!(producer.state(), StoreState::Stopped);
    }

    #[tokio::test]
    async fn in_memory_config_opens_without_file() {
        let store = MetricStore::from_config(&StoreConfig::in_memory()).unwrap();
        store.healthy().await.unwrap();
        store.shutdown().await.unwrap();
    }
}
