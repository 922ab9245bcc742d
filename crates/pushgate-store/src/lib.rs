//! pushgate-store: the metric store behind the Pushgate push gateway.
//!
//! Holds the last pushed value of every (job, instance, metric name) group,
//! serves consistent copies to concurrent readers, and checkpoints the whole
//! state to disk so a restart loses nothing.
//!
//! # Architecture
//!
//! ```text
//! MetricStore (Clone, shared by producers and readers)
//!   ├── submit_write_request() ──► mpsc queue ──► Writer task
//!   │                                              ├── Snapshot::apply() under write lock
//!   │                                              └── Persistor::write_encoded() on deadline
//!   ├── get_metric_families() / get_metric_families_map() ◄── read lock + copy
//!   └── shutdown() → drain queue → final checkpoint → writer exits
//! ```
//!
//! Requests from all producers are applied in one global submission order.
//! Each request is applied inside its own write-lock critical section, so a
//! reader sees every group either before or after a request, never halfway.

pub mod error;
pub mod metrics;
pub mod persist;
pub mod prometheus;
pub mod snapshot;
pub mod store;
mod writer;

pub use error::{PersistError, PersistResult, StoreError, StoreResult};
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use persist::{decode_snapshot, encode_snapshot, CheckpointStats, Persistor};
pub use prometheus::render_prometheus;
pub use snapshot::{ApplyOutcome, Snapshot};
pub use store::{MetricStore, StoreState};
