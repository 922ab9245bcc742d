//! Hierarchical snapshot: the job → instance → name map and the rules for
//! changing it.
//!
//! Only the writer task mutates a `Snapshot`. Readers get copies: the three
//! map levels are cloned, the families themselves are shared `Arc`s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use pushgate_core::{
    check_labels, JobToInstanceMap, MetricFamily, TimestampedMetricFamily, WriteRequest,
};

/// What applying one request did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Families stored (each replacing its slot).
    pub families_written: usize,
    /// Families dropped entirely: name mismatch or no consistent metrics.
    pub families_rejected: usize,
    /// Individual metrics dropped for inconsistent job/instance labels.
    pub metrics_rejected: usize,
    /// Whether this was a delete request.
    pub delete: bool,
    /// Whether the snapshot changed.
    pub changed: bool,
}

/// The current state of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    groups: JobToInstanceMap,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a write or delete request.
    pub fn apply(&mut self, req: WriteRequest) -> ApplyOutcome {
        match req.metric_families {
            None => {
                let changed = self.delete(&req.job, &req.instance);
                debug!(job = %req.job, instance = %req.instance, changed, "group deleted");
                ApplyOutcome {
                    delete: true,
                    changed,
                    ..ApplyOutcome::default()
                }
            }
            Some(families) => self.write(&req.job, &req.instance, req.timestamp, families),
        }
    }

    fn write(
        &mut self,
        job: &str,
        instance: &str,
        timestamp: SystemTime,
        families: HashMap<String, MetricFamily>,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut accepted = Vec::with_capacity(families.len());

        for (name, family) in families {
            if name != family.name() {
                warn!(%job, %instance, key = %name, family = %family.name(),
                    "family name does not match its key; dropped");
                outcome.families_rejected += 1;
                continue;
            }
            if let Err(e) = family.validate() {
                warn!(%job, %instance, family = %name, error = %e, "malformed family dropped");
                outcome.families_rejected += 1;
                continue;
            }
            let check = check_labels(job, instance, &family);
            if check.rejected > 0 {
                warn!(%job, %instance, family = %name, rejected = check.rejected,
                    "metrics with inconsistent job/instance labels dropped");
                outcome.metrics_rejected += check.rejected;
            }
            match check.accepted {
                Some(family) => accepted.push((name, family)),
                None => outcome.families_rejected += 1,
            }
        }

        if accepted.is_empty() {
            return outcome;
        }
        let timestamp = if timestamp < SystemTime::UNIX_EPOCH {
            warn!(%job, %instance, "push timestamp before the Unix epoch, clamped");
            SystemTime::UNIX_EPOCH
        } else {
            timestamp
        };

        let names = self
            .groups
            .entry(job.to_string())
            .or_default()
            .entry(instance.to_string())
            .or_default();
        for (name, family) in accepted {
            names.insert(name, TimestampedMetricFamily::new(timestamp, family));
            outcome.families_written += 1;
        }
        outcome.changed = true;
        debug!(%job, %instance, families = outcome.families_written, "group updated");
        outcome
    }

    /// Remove a whole job (empty `instance`) or one of its instances,
    /// pruning the job once it has no instances left.
    fn delete(&mut self, job: &str, instance: &str) -> bool {
        if instance.is_empty() {
            return self.groups.remove(job).is_some();
        }
        let Some(instances) = self.groups.get_mut(job) else {
            return false;
        };
        let removed = instances.remove(instance).is_some();
        if instances.is_empty() {
            self.groups.remove(job);
        }
        removed
    }

    /// Put a family into its slot without label checks. Used when
    /// restoring a checkpoint whose records were validated by the decoder.
    pub(crate) fn insert(
        &mut self,
        job: String,
        instance: String,
        name: String,
        family: TimestampedMetricFamily,
    ) -> Option<TimestampedMetricFamily> {
        self.groups
            .entry(job)
            .or_default()
            .entry(instance)
            .or_default()
            .insert(name, family)
    }

    pub fn get(&self, job: &str, instance: &str, name: &str) -> Option<&TimestampedMetricFamily> {
        self.groups.get(job)?.get(instance)?.get(name)
    }

    /// Number of stored families.
    pub fn len(&self) -> usize {
        self.groups
            .values()
            .flat_map(|instances| instances.values())
            .map(|names| names.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every slot, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, &TimestampedMetricFamily)> {
        self.groups.iter().flat_map(|(job, instances)| {
            instances.iter().flat_map(move |(instance, names)| {
                names
                    .iter()
                    .map(move |(name, tmf)| (job.as_str(), instance.as_str(), name.as_str(), tmf))
            })
        })
    }

    /// Every slot ordered by (job, instance, name).
    pub fn sorted_entries(&self) -> Vec<(&str, &str, &str, &TimestampedMetricFamily)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_unstable_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        entries
    }

    /// All stored families, flat. The `Arc`s are shared with the snapshot.
    pub fn metric_families(&self) -> Vec<Arc<MetricFamily>> {
        self.iter()
            .map(|(_, _, _, tmf)| Arc::clone(&tmf.metric_family))
            .collect()
    }

    /// An independently owned copy of the hierarchy.
    pub fn to_map(&self) -> JobToInstanceMap {
        self.groups.clone()
    }

    /// Families merged by name across groups, ready for exposition.
    ///
    /// Metrics of same-named families are concatenated in (job, instance)
    /// order. The first family seen for a name fixes its kind and help; a
    /// later family of another kind is skipped, differing help is kept
    /// from the first.
    pub fn gather(&self) -> Vec<MetricFamily> {
        let mut merged: Vec<MetricFamily> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();

        for (job, instance, name, tmf) in self.sorted_entries() {
            let family = tmf.metric_family.as_ref();
            let Some(&pos) = position.get(name) else {
                position.insert(name, merged.len());
                merged.push(family.clone());
                continue;
            };
            let existing = &mut merged[pos];
            if existing.help() != family.help() {
                warn!(%job, %instance, family = %name, "help text differs between groups");
            }
            match existing.concat(family) {
                Ok(combined) => *existing = combined,
                Err(e) => {
                    warn!(%job, %instance, family = %name, error = %e,
                        "family kind conflicts with other groups; skipped");
                }
            }
        }
        merged
    }

    /// Latest receive time among the families of a (job, instance) group.
    pub fn push_timestamp(&self, job: &str, instance: &str) -> Option<SystemTime> {
        self.groups
            .get(job)?
            .get(instance)?
            .values()
            .map(|tmf| tmf.timestamp)
            .max()
    }
}
