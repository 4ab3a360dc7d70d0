//! Queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Configuration shared by every poll loop consuming a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Lanes to consume. Position is priority: earlier lanes are claimed first.
    pub lanes: Vec<String>,
    /// Poll interval of the worker loop and of each job's heartbeat monitor.
    #[serde(with = "duration_millis")]
    pub heartbeat: Duration,
    /// How long a running job may go without a heartbeat before it can be claimed again.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Maximum number of interrupted attempts before a job is failed without running.
    pub tries: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lanes: vec!["default".to_string()],
            heartbeat: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            tries: 3,
        }
    }
}

impl QueueConfig {
    /// Create a new builder.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// Check the configuration can drive a poll loop.
    pub fn validate(&self) -> Result<()> {
        if self.lanes.is_empty() {
            return Err(QueueError::Config("at least one lane is required".to_string()));
        }
        if self.lanes.iter().any(|lane| lane.is_empty()) {
            return Err(QueueError::Config("lane names must not be empty".to_string()));
        }
        if self.heartbeat.is_zero() {
            return Err(QueueError::Config("heartbeat must be positive".to_string()));
        }
        if self.timeout <= self.heartbeat {
            tracing::warn!(
                heartbeat = ?self.heartbeat,
                timeout = ?self.timeout,
                "Timeout does not exceed heartbeat, live jobs may be reclaimed"
            );
        }
        if self.tries < 0 {
            return Err(QueueError::Config("tries must not be negative".to_string()));
        }
        Ok(())
    }

    /// Priority rank of a lane, `None` if the lane is not consumed.
    pub fn lane_rank(&self, lane: &str) -> Option<usize> {
        self.lanes.iter().position(|l| l == lane)
    }
}

/// Builder for QueueConfig.
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lanes, highest priority first.
    pub fn lanes<I, S>(mut self, lanes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.lanes = lanes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.config.heartbeat = interval;
        self
    }

    /// Set the stale lease timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the retry budget.
    pub fn tries(mut self, tries: i32) -> Self {
        self.config.tries = tries;
        self
    }

    /// Build and validate the QueueConfig.
    pub fn build(self) -> Result<QueueConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Durations as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
