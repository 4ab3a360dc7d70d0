//! In-memory store for the laneq job queue.
//!
//! Keeps job rows in a map behind a single async lock. Every store operation
//! takes the lock once, which gives the same atomicity the PostgreSQL store
//! gets from its single-statement queries. Useful for tests and demos.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use laneq_core::Client;
//! use laneq_memory::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> laneq_core::Result<()> {
//!     let store = MemoryStore::new();
//!     let client = Client::new(store.clone());
//!     client.enqueue("default", serde_json::json!({"hello": "world"})).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use laneq_core::{ClaimedJob, Job, JobId, NewJob, QueueError, Result, Status, Store};

/// In-memory job store. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a store error, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a job's heartbeat timestamp.
    pub async fn set_heartbeat_at(&self, id: &JobId, at: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(QueueError::JobNotFound(*id))?;
        job.heartbeat_at = at;
        Ok(())
    }

    /// Number of rows, whatever their status.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Store("memory store unavailable".to_string()));
        }
        Ok(())
    }
}

/// Whether a row can be claimed.
fn is_eligible(job: &Job, stale_before: DateTime<Utc>) -> bool {
    match job.status {
        Status::Pending => true,
        Status::Running => job.heartbeat_at < stale_before,
        _ => false,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn claim(
        &self,
        lanes: &[String],
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;

        let job = jobs
            .values_mut()
            .filter_map(|job| {
                let rank = lanes.iter().position(|lane| *lane == job.lane)?;
                is_eligible(job, stale_before).then_some((rank, job))
            })
            .min_by(|(rank_a, a), (rank_b, b)| {
                rank_a
                    .cmp(rank_b)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|(_, job)| job);

        let Some(job) = job else {
            return Ok(None);
        };

        job.status = Status::Running;
        job.heartbeat_at = now;
        job.r#try += 1;

        Ok(Some(ClaimedJob {
            id: job.id,
            lane: job.lane.clone(),
            r#try: job.r#try,
            status: job.status,
            created_at: job.created_at,
            payload: job.to_payload()?,
        }))
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Status>> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;

        Ok(jobs.get_mut(id).map(|job| {
            job.heartbeat_at = now;
            job.status
        }))
    }

    async fn set_status(&self, id: &JobId, status: Status) -> Result<()> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;

        // Updating a missing row is a no-op, as in SQL.
        if let Some(job) = jobs.get_mut(id) {
            job.status = status;
        }
        Ok(())
    }

    async fn push_job(&self, job: NewJob) -> Result<()> {
        self.check_available()?;
        let job = job.into_job();
        let mut jobs = self.jobs.write().await;

        if jobs.contains_key(&job.id) {
            return Err(QueueError::Store(format!("duplicate job id {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.check_available()?;
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn request_cancel(&self, id: &JobId) -> Result<bool> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;

        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        match job.status {
            Status::Pending => job.status = Status::Cancelled,
            Status::Running => job.status = Status::Cancelling,
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool> {
        self.check_available()?;
        Ok(self.jobs.write().await.remove(id).is_some())
    }

    async fn count_by_status(&self, status: Status) -> Result<usize> {
        self.check_available()?;
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|job| job.status == status).count())
    }
}
