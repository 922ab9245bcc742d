//! pushgate.toml configuration parser.
//!
//! ```toml
//! [persistence]
//! file = "/var/lib/pushgate/metrics.ckpt"
//! interval = "5m"
//! ```
//!
//! Without a `[persistence]` section the store runs purely in memory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Default checkpoint interval.
pub const DEFAULT_PERSISTENCE_INTERVAL: &str = "5m";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub persistence: Option<PersistenceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Checkpoint file. Written via `<file>.in_progress` and renamed.
    pub file: PathBuf,
    /// Minimum time between a change and its checkpoint, e.g. "30s", "5m".
    /// "0s" checkpoints after every applied batch.
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_interval() -> String {
    DEFAULT_PERSISTENCE_INTERVAL.to_string()
}

impl StoreConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: StoreConfig = toml::from_str(content)?;
        if let Some(persistence) = &config.persistence {
            persistence.interval()?;
        }
        Ok(config)
    }

    pub fn in_memory() -> Self {
        Self { persistence: None }
    }

    pub fn with_persistence(file: impl Into<PathBuf>, interval: impl Into<String>) -> Self {
        Self {
            persistence: Some(PersistenceConfig {
                file: file.into(),
                interval: interval.into(),
            }),
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl PersistenceConfig {
    /// The parsed checkpoint interval.
    pub fn interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.interval)
            .ok_or_else(|| anyhow!("invalid persistence interval {:?}", self.interval))
    }
}

/// Parse "250ms", "30s", "5m", "1h", or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
