//! Client for producing and managing jobs.

use serde::Serialize;

use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, NewJob, Status};
use crate::store::{SharedStore, Store};

/// Client for enqueueing and managing jobs.
///
/// This is the "outside world" from the worker's point of view: everything
/// it does (cancellation, forced statuses, deletion) is picked up by the
/// heartbeat monitor of the worker running the job.
#[derive(Clone)]
pub struct Client<S: Store + Clone = SharedStore> {
    store: S,
}

impl Client<SharedStore> {
    /// Create a new client with a shared store.
    pub fn new(store: impl Store + 'static) -> Self {
        Self {
            store: SharedStore::new(store),
        }
    }
}

impl<S: Store + Clone> Client<S> {
    /// Create a new client with a specific store.
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    /// Enqueue a job on a lane.
    pub async fn enqueue<T: Serialize>(&self, lane: &str, payload: T) -> Result<JobId> {
        let payload = serde_json::to_value(payload)?;
        self.enqueue_job(NewJob::new(lane, payload)).await
    }

    /// Enqueue a pre-built job.
    pub async fn enqueue_job(&self, job: NewJob) -> Result<JobId> {
        let job_id = job.id;
        let lane = job.lane.clone();
        self.store.push_job(job).await?;

        tracing::debug!(job_id = %job_id, lane = %lane, "Job enqueued");
        Ok(job_id)
    }

    /// Ask a job to stop.
    ///
    /// A running job's handler is cancelled within one heartbeat and the job
    /// ends `cancelled`. A pending job is cancelled immediately.
    pub async fn cancel(&self, id: &JobId) -> Result<bool> {
        let changed = self.store.request_cancel(id).await?;
        tracing::debug!(job_id = %id, changed, "Cancellation requested");
        Ok(changed)
    }

    /// Force a job's status.
    ///
    /// Fails with `JobNotFound` if the row does not exist.
    pub async fn set_status(&self, id: &JobId, status: Status) -> Result<()> {
        if self.store.get_job(id).await?.is_none() {
            return Err(QueueError::JobNotFound(*id));
        }
        self.store.set_status(id, status).await?;
        tracing::debug!(job_id = %id, status = %status, "Job status forced");
        Ok(())
    }

    /// Delete a job. A worker running it stops within one heartbeat.
    pub async fn delete(&self, id: &JobId) -> Result<bool> {
        let removed = self.store.remove_job(id).await?;
        tracing::debug!(job_id = %id, removed, "Job deleted");
        Ok(removed)
    }

    /// Fetch a job.
    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    /// Number of jobs with the given status.
    pub async fn count(&self, status: Status) -> Result<usize> {
        self.store.count_by_status(status).await
    }
}
