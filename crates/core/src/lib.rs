//! # laneq-core - Lease-based job queue
//!
//! Workers poll a shared store, lease one job at a time and keep the lease
//! alive with heartbeats while the handler runs:
//! - `Store` trait for storage implementations
//! - `Job`, `JobId`, `Status`, `Payload` types
//! - `Worker`, the claim/heartbeat/resolve poll loop
//! - `WorkerPool` for running several loops
//! - `Client` for enqueueing and managing jobs
//!
//! Delivery is at-least-once: a job interrupted by shutdown or a crash is
//! claimed again once its heartbeat is older than the configured timeout, so
//! handlers must be idempotent.

mod client;
mod config;
mod error;
mod heartbeat;
mod job;
mod pool;
mod resolver;
mod store;
mod worker;

// Re-export main types
pub use client::Client;
pub use config::{QueueConfig, QueueConfigBuilder};
pub use error::{log_error, QueueError, Result};
pub use heartbeat::{Monitor, MonitorReport};
pub use job::{ClaimedJob, Job, JobId, NewJob, Payload, Status};
pub use pool::{generate_pool_id, WorkerPool, WorkerPoolBuilder};
pub use resolver::{resolve, Outcome, Resolution};
pub use store::{DynStore, SharedStore, Store};
pub use worker::{CycleOutcome, JobContext, Worker};

pub use tokio_util::sync::CancellationToken;
