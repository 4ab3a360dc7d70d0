//! Store abstraction for job rows.
//!
//! The poll loop only needs three primitives from the store: an atomic
//! claim, an atomic heartbeat that reads back the status, and a keyed status
//! update. The remaining operations serve producers and operators through
//! [`Client`](crate::Client).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::job::{ClaimedJob, Job, JobId, NewJob, Status};

/// Storage operations for a job queue.
///
/// Implementations must be thread-safe and every operation must be a single
/// atomic statement: the worker never holds locks across calls.
#[async_trait]
pub trait Store: Send + Sync {
    // ========== Worker Operations ==========

    /// Lease the next eligible job.
    ///
    /// Eligible rows are in one of `lanes` and either `pending`, or `running`
    /// with `heartbeat_at < stale_before`. Rows are ordered by the position of
    /// their lane in `lanes`, then by `created_at`. The chosen row is moved to
    /// `running`, its `try` incremented and `heartbeat_at` set to `now`, all in
    /// the same statement that selected it.
    ///
    /// Returns `None` when no row is eligible.
    async fn claim(
        &self,
        lanes: &[String],
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>>;

    /// Refresh a job's heartbeat and return its current status.
    ///
    /// Returns `None` when the row no longer exists.
    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Status>>;

    /// Set the status of a job.
    async fn set_status(&self, id: &JobId, status: Status) -> Result<()>;

    // ========== Producer / Admin Operations ==========

    /// Insert a new pending job.
    async fn push_job(&self, job: NewJob) -> Result<()>;

    /// Fetch a job row.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Ask for a job to stop.
    ///
    /// Running jobs move to `cancelling`, pending jobs straight to
    /// `cancelled`. Returns `false` if the job is missing or already settled.
    async fn request_cancel(&self, id: &JobId) -> Result<bool>;

    /// Delete a job row. Returns whether a row was removed.
    async fn remove_job(&self, id: &JobId) -> Result<bool>;

    /// Count jobs with the given status.
    async fn count_by_status(&self, status: Status) -> Result<usize>;

    /// Release resources held by the store.
    async fn close(&self) {}
}

/// A type-erased store that can be shared across threads.
pub type DynStore = Arc<dyn Store>;

/// Wrapper around Arc<dyn Store> for convenience.
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any Store implementation.
    pub fn new<S: Store + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

impl From<DynStore> for SharedStore {
    fn from(inner: DynStore) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Store for SharedStore {
    async fn claim(
        &self,
        lanes: &[String],
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>> {
        self.inner.claim(lanes, now, stale_before).await
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Status>> {
        self.inner.heartbeat(id, now).await
    }

    async fn set_status(&self, id: &JobId, status: Status) -> Result<()> {
        self.inner.set_status(id, status).await
    }

    async fn push_job(&self, job: NewJob) -> Result<()> {
        self.inner.push_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn request_cancel(&self, id: &JobId) -> Result<bool> {
        self.inner.request_cancel(id).await
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool> {
        self.inner.remove_job(id).await
    }

    async fn count_by_status(&self, status: Status) -> Result<usize> {
        self.inner.count_by_status(status).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
