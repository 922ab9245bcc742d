//! Write requests and the hierarchical snapshot types.
//!
//! The store state is a three-level map: job → instance → metric name →
//! [`TimestampedMetricFamily`]. A [`WriteRequest`] either replaces whole
//! families inside one (job, instance) group or, when it carries no
//! families, deletes a job or a single instance of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::model::{Metric, MetricFamily};

/// Label every stored metric must carry with the group's job.
pub const JOB_LABEL: &str = "job";

/// Label every stored metric must carry with the group's instance.
pub const INSTANCE_LABEL: &str = "instance";

/// metric name → family.
pub type NameToTimestampedMetricFamilyMap = HashMap<String, TimestampedMetricFamily>;

/// instance → metric name → family.
pub type InstanceToNameMap = HashMap<String, NameToTimestampedMetricFamilyMap>;

/// job → instance → metric name → family.
pub type JobToInstanceMap = HashMap<String, InstanceToNameMap>;

/// A metric family together with the time its push was received.
///
/// The family sits behind an `Arc`: the store and every reader copy share
/// one allocation, which is sound because families are immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedMetricFamily {
    pub timestamp: SystemTime,
    pub metric_family: Arc<MetricFamily>,
}

impl TimestampedMetricFamily {
    pub fn new(timestamp: SystemTime, metric_family: MetricFamily) -> Self {
        Self {
            timestamp,
            metric_family: Arc::new(metric_family),
        }
    }
}

/// A queued change to the store.
///
/// `metric_families: None` deletes the group: the whole job when
/// `instance` is empty, otherwise only that instance. `timestamp` is the
/// time the request arrived from the network and is unrelated to sample
/// timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub job: String,
    pub instance: String,
    pub timestamp: SystemTime,
    pub metric_families: Option<HashMap<String, MetricFamily>>,
}

impl WriteRequest {
    /// An update keyed by each family's own name, stamped with the current time.
    pub fn push(
        job: impl Into<String>,
        instance: impl Into<String>,
        families: impl IntoIterator<Item = MetricFamily>,
    ) -> Self {
        let metric_families = families
            .into_iter()
            .map(|mf| (mf.name().to_string(), mf))
            .collect();
        Self {
            job: job.into(),
            instance: instance.into(),
            timestamp: SystemTime::now(),
            metric_families: Some(metric_families),
        }
    }

    /// A delete of the job (empty `instance`) or of one instance.
    pub fn delete(job: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            instance: instance.into(),
            timestamp: SystemTime::now(),
            metric_families: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.metric_families.is_none()
    }
}

/// Result of [`check_labels`].
#[derive(Debug, Clone, PartialEq)]
pub struct LabelCheck {
    /// The family reduced to its consistent metrics, or `None` when every
    /// metric was inconsistent.
    pub accepted: Option<MetricFamily>,
    /// Number of metrics dropped.
    pub rejected: usize,
}

/// Split a family into metrics whose `job`/`instance` labels match the
/// group and metrics that do not.
///
/// A family with no metrics at all is accepted unchanged.
pub fn check_labels(job: &str, instance: &str, family: &MetricFamily) -> LabelCheck {
    let consistent = |m: &Metric| m.label(JOB_LABEL) == job && m.label(INSTANCE_LABEL) == instance;
    let rejected = family.metrics().iter().filter(|&m| !consistent(m)).count();

    if rejected == 0 {
        return LabelCheck {
            accepted: Some(family.clone()),
            rejected,
        };
    }
    if rejected == family.len() {
        return LabelCheck {
            accepted: None,
            rejected,
        };
    }
    LabelCheck {
        accepted: Some(family.filter_metrics(consistent)),
        rejected,
    }
}
