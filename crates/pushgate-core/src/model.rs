//! Metric family model.
//!
//! A [`MetricFamily`] is a named group of samples sharing one kind and help
//! text. The per-sample payload is a closed [`MetricValue`] variant carrying
//! the fields of its kind. Families are validated when they are built and
//! expose accessors only, so a family handed to the store cannot change
//! underneath a reader.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

// ── Kinds ──────────────────────────────────────────────────────────

/// The type tag of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Summary,
    Histogram,
    Untyped,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Summary => "summary",
            MetricKind::Histogram => "histogram",
            MetricKind::Untyped => "untyped",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Values ─────────────────────────────────────────────────────────

/// One quantile of a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
    #[serde(with = "prom_float")]
    pub quantile: f64,
    #[serde(with = "prom_float")]
    pub value: f64,
}

/// One cumulative bucket of a histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Inclusive upper bound; the last bucket is usually `+Inf`.
    #[serde(with = "prom_float")]
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

/// Sample payload, one variant per metric kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricValue {
    Counter {
        #[serde(with = "prom_float")]
        value: f64,
    },
    Gauge {
        #[serde(with = "prom_float")]
        value: f64,
    },
    Untyped {
        #[serde(with = "prom_float")]
        value: f64,
    },
    Summary {
        sample_count: u64,
        #[serde(with = "prom_float")]
        sample_sum: f64,
        quantiles: Vec<Quantile>,
    },
    Histogram {
        sample_count: u64,
        #[serde(with = "prom_float")]
        sample_sum: f64,
        buckets: Vec<Bucket>,
    },
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter { .. } => MetricKind::Counter,
            MetricValue::Gauge { .. } => MetricKind::Gauge,
            MetricValue::Untyped { .. } => MetricKind::Untyped,
            MetricValue::Summary { .. } => MetricKind::Summary,
            MetricValue::Histogram { .. } => MetricKind::Histogram,
        }
    }
}

// ── Metric ─────────────────────────────────────────────────────────

/// A single sample: label set, value, and an optional timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    labels: BTreeMap<String, String>,
    value: MetricValue,
    /// Milliseconds since the Unix epoch, as sent by the pusher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp_ms: Option<i64>,
}

impl Metric {
    pub fn new(value: MetricValue) -> Self {
        Self {
            labels: BTreeMap::new(),
            value,
            timestamp_ms: None,
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Value of the named label. An absent label reads as the empty string,
    /// which the exposition model treats as equivalent.
    pub fn label(&self, name: &str) -> &str {
        self.labels.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn value(&self) -> &MetricValue {
        &self.value
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp_ms
    }
}

// ── Family ─────────────────────────────────────────────────────────

/// A named metric family. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    name: String,
    help: String,
    kind: MetricKind,
    metrics: Vec<Metric>,
}

impl MetricFamily {
    /// Build and validate a family.
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        kind: MetricKind,
        metrics: Vec<Metric>,
    ) -> ModelResult<Self> {
        let family = Self {
            name: name.into(),
            help: help.into(),
            kind,
            metrics,
        };
        family.validate()?;
        Ok(family)
    }

    /// Check the name, every label name, and that each sample matches the
    /// family kind. Deserialized families bypass `new`, so decoders call this.
    pub fn validate(&self) -> ModelResult<()> {
        if !is_valid_metric_name(&self.name) {
            return Err(ModelError::InvalidMetricName(self.name.clone()));
        }
        for metric in &self.metrics {
            if let Some(label) = metric.labels.keys().find(|l| !is_valid_label_name(l)) {
                return Err(ModelError::InvalidLabelName {
                    family: self.name.clone(),
                    label: label.clone(),
                });
            }
            let found = metric.value.kind();
            if found != self.kind {
                return Err(ModelError::KindMismatch {
                    family: self.name.clone(),
                    expected: self.kind,
                    found,
                });
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// A copy of this family holding only the metrics `keep` accepts.
    pub fn filter_metrics(&self, mut keep: impl FnMut(&Metric) -> bool) -> Self {
        Self {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: self.kind,
            metrics: self.metrics.iter().filter(|&m| keep(m)).cloned().collect(),
        }
    }

    /// A new family with `other`'s metrics appended to this one's.
    /// Name and help are taken from `self`; kinds must agree.
    pub fn concat(&self, other: &MetricFamily) -> ModelResult<Self> {
        if other.kind != self.kind {
            return Err(ModelError::KindMismatch {
                family: self.name.clone(),
                expected: self.kind,
                found: other.kind,
            });
        }
        let mut metrics = Vec::with_capacity(self.metrics.len() + other.metrics.len());
        metrics.extend_from_slice(&self.metrics);
        metrics.extend_from_slice(&other.metrics);
        Ok(Self {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: self.kind,
            metrics,
        })
    }
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Serde adapter for sample floats. JSON has no NaN or infinities, so
/// non-finite values are written as the exposition-format strings
/// `NaN`, `+Inf` and `-Inf`.
mod prom_float {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("+Inf")
        } else {
            serializer.serialize_str("-Inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "+Inf" => Ok(f64::INFINITY),
                "-Inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid sample value {other:?}"))),
            },
        }
    }
}
