//! Error types for the laneq job queue.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::job::JobId;

/// The main error type for laneq.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Store operation failed. Treated as transient by the poll loop.
    #[error("Store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A status string read from the store is not a known status.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// An error annotated with key/value context for structured logging.
    #[error("{}", render_context(.message, .source))]
    Context {
        message: String,
        fields: BTreeMap<String, String>,
        #[source]
        source: Box<QueueError>,
    },
}

impl QueueError {
    /// Wrap this error with a message.
    pub fn context(self, message: impl Into<String>) -> Self {
        match self {
            QueueError::Context {
                message: inner,
                fields,
                source,
            } => QueueError::Context {
                message: if inner.is_empty() {
                    message.into()
                } else {
                    format!("{}: {}", message.into(), inner)
                },
                fields,
                source,
            },
            other => QueueError::Context {
                message: message.into(),
                fields: BTreeMap::new(),
                source: Box::new(other),
            },
        }
    }

    /// Attach a key/value pair. Wraps the error in `Context` if needed.
    pub fn with_field(self, key: impl Into<String>, value: impl ToString) -> Self {
        match self {
            QueueError::Context {
                message,
                mut fields,
                source,
            } => {
                fields.insert(key.into(), value.to_string());
                QueueError::Context {
                    message,
                    fields,
                    source,
                }
            }
            other => {
                let mut fields = BTreeMap::new();
                fields.insert(key.into(), value.to_string());
                QueueError::Context {
                    message: String::new(),
                    fields,
                    source: Box::new(other),
                }
            }
        }
    }

    /// Context fields attached to this error, if any.
    pub fn fields(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            QueueError::Context { fields, .. } => Some(fields),
            _ => None,
        }
    }

    /// The innermost error, skipping `Context` layers.
    pub fn root(&self) -> &QueueError {
        match self {
            QueueError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

fn render_context(message: &str, source: &QueueError) -> String {
    if message.is_empty() {
        source.to_string()
    } else {
        format!("{}: {}", message, source)
    }
}

/// Log an error at error level, surfacing any context fields.
pub fn log_error(err: &QueueError, message: &str) {
    match err.fields() {
        Some(fields) if !fields.is_empty() => {
            tracing::error!(error = %err, fields = ?fields, "{}", message);
        }
        _ => {
            tracing::error!(error = %err, "{}", message);
        }
    }
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
