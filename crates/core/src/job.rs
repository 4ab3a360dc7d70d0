//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::QueueError;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// The status of a job row.
///
/// `Pending` and `Running` are live states. `Cancelling` is a request from
/// outside to stop a running handler. Everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
    Ignored,
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Status; 7] = [
        Status::Pending,
        Status::Running,
        Status::Succeeded,
        Status::Failed,
        Status::Cancelling,
        Status::Cancelled,
        Status::Ignored,
    ];

    /// The text stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Cancelling => "cancelling",
            Status::Cancelled => "cancelled",
            Status::Ignored => "ignored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Cancelled | Status::Ignored
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::InvalidStatus(s.to_string()))
    }
}

/// The full row of a job, as surfaced to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub serde_json::Value);

impl Payload {
    /// Deserialize the row (or a part of it) into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }

    /// Deserialize a single column of the row.
    pub fn field<T: DeserializeOwned>(&self, column: &str) -> Result<Option<T>, serde_json::Error> {
        match self.0.get(column) {
            Some(value) => T::deserialize(value).map(Some),
            None => Ok(None),
        }
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub lane: String,
    /// Attempt counter, incremented on every claim.
    pub r#try: i32,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Producer-supplied data.
    pub payload: serde_json::Value,
}

impl Job {
    /// The full row as JSON, the way the store hands it to handlers.
    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        serde_json::to_value(self).map(Payload)
    }
}

/// A job about to be inserted by a producer.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub lane: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new(lane: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            lane: lane.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Override the creation time, which orders jobs within a lane.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// The row this job becomes once inserted.
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            lane: self.lane,
            r#try: 0,
            status: Status::Pending,
            created_at: self.created_at,
            heartbeat_at: self.created_at,
            payload: self.payload,
        }
    }
}

/// A job leased by a successful claim.
///
/// Fields reflect the row after the claim: `try` already incremented,
/// status `Running`, heartbeat stamped.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub lane: String,
    pub r#try: i32,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub payload: Payload,
}

impl ClaimedJob {
    /// Number of times this job was claimed before the current claim.
    pub fn prior_attempts(&self) -> i32 {
        self.r#try - 1
    }
}
