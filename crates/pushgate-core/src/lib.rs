//! pushgate-core: shared types for the Pushgate metric store.
//!
//! - [`model`]: the metric family value type. Families are validated on
//!   construction and immutable afterwards.
//! - [`request`]: write/delete requests, the job → instance → name
//!   snapshot maps, and label-consistency checking.
//! - [`config`]: `pushgate.toml` parsing for the store.

pub mod config;
pub mod error;
pub mod model;
pub mod request;

pub use config::{PersistenceConfig, StoreConfig};
pub use error::{ModelError, ModelResult};
pub use model::{Bucket, Metric, MetricFamily, MetricKind, MetricValue, Quantile};
pub use request::*;
