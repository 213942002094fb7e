//! Typed scheduler configuration.
//!
//! Built from defaults, environment variables or a TOML document, and
//! validated before a scheduler is started.

pub mod defaults;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use defaults::{
    DEFAULT_CONSUMER_COUNT, DEFAULT_DUE_TIME_SECS, SECONDS_MULTIPLIER_MS, UNBOUNDED_QUEUE_ITEMS,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Long-running consumer workers. Must be > 0.
    pub consumer_count: usize,
    /// Per-item deadline in seconds. Must be > 0.
    pub due_time_secs: u64,
    /// Capacity bound on pending + in-flight items; any value <= 0 means unbounded.
    pub max_queue_items: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            consumer_count: DEFAULT_CONSUMER_COUNT,
            due_time_secs: DEFAULT_DUE_TIME_SECS,
            max_queue_items: UNBOUNDED_QUEUE_ITEMS,
        }
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    scheduler: SchedulerConfig,
}

impl SchedulerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            consumer_count: parsed_var("WORKQ_CONSUMER_COUNT")?.unwrap_or(defaults.consumer_count),
            due_time_secs: parsed_var("WORKQ_DUE_TIME_SECS")?.unwrap_or(defaults.due_time_secs),
            max_queue_items: parsed_var("WORKQ_MAX_QUEUE_ITEMS")?
                .unwrap_or(defaults.max_queue_items),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[scheduler]` table of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad scheduler config: {e}")))?;
        file.scheduler.validate()?;
        Ok(file.scheduler)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer_count == 0 {
            return Err(Error::InvalidArgument(
                "consumer_count must be greater than zero".to_string(),
            ));
        }
        if self.due_time_secs == 0 {
            return Err(Error::InvalidArgument(
                "due_time_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured due-time, converted through the fixed seconds multiplier.
    pub fn due_time(&self) -> Duration {
        Duration::from_millis(self.due_time_secs.saturating_mul(SECONDS_MULTIPLIER_MS))
    }

    /// `None` when admission is unbounded.
    pub fn capacity(&self) -> Option<usize> {
        usize::try_from(self.max_queue_items)
            .ok()
            .filter(|max| *max > 0)
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("environment variable {name}: {e}"))),
    }
}
