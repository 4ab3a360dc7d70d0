//! The poll loop: claim, guard, execute, resolve.

use chrono::{DateTime, TimeDelta, Utc};
use std::future::Future;
use std::marker::PhantomData;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, Span};

use crate::config::QueueConfig;
use crate::error::{log_error, Result};
use crate::heartbeat::{Monitor, MonitorReport};
use crate::job::{ClaimedJob, JobId, Payload, Status};
use crate::resolver::{resolve, Outcome, Resolution};
use crate::store::Store;

/// Handle given to a job handler.
///
/// Carries the job's cancellation token and the tracing span all events about
/// the job are recorded under.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    lane: String,
    attempt: i32,
    token: CancellationToken,
    span: Span,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn lane(&self) -> &str {
        &self.lane
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    /// Whether the job should stop.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the job should stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Span for the job, already entered while the handler runs.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// What a single poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to claim.
    Idle,
    /// Retry budget exhausted; marked failed without running.
    FailedFast(JobId),
    /// Job executed and resolved.
    Resolved(JobId, Resolution),
    /// A store error ended the cycle early.
    Aborted,
}

/// A single poll loop.
///
/// Claims at most one job per heartbeat tick and runs it to completion before
/// claiming again.
pub struct Worker<S, F, Fut>
where
    S: Store + Clone + 'static,
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    id: usize,
    store: S,
    config: QueueConfig,
    handler: F,
    root: CancellationToken,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<S, F, Fut> Worker<S, F, Fut>
where
    S: Store + Clone + 'static,
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    pub fn new(
        id: usize,
        store: S,
        config: QueueConfig,
        handler: F,
        root: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            config,
            handler,
            root,
            _phantom: PhantomData,
        }
    }

    /// Poll until the root token is cancelled.
    ///
    /// Returns as soon as cancellation is observed between cycles. A job in
    /// flight sees the cancellation through its own token.
    pub async fn run(&self) {
        tracing::debug!(worker_id = self.id, "Worker started");

        let period = self.config.heartbeat;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.process_next().await;
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    /// Run one cycle: claim a job, then fail it fast or execute and resolve it.
    pub async fn process_next(&self) -> CycleOutcome {
        let job = match self.claim().await {
            Ok(Some(job)) => job,
            Ok(None) => return CycleOutcome::Idle,
            Err(e) => {
                log_error(&e.with_field("worker_id", self.id), "Failed to claim job");
                return CycleOutcome::Aborted;
            }
        };

        let span = tracing::debug_span!(
            "job",
            job_id = %job.id,
            lane = %job.lane,
            attempt = job.r#try,
        );

        async move {
            tracing::debug!("Job claimed");

            if job.prior_attempts() > self.config.tries {
                return self.fail_fast(&job).await;
            }

            self.execute(job).await
        }
        .instrument(span)
        .await
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        self.store
            .claim(&self.config.lanes, now, stale_before(now, self.config.timeout))
            .await
    }

    /// Mark a job that keeps getting interrupted as failed without running it.
    async fn fail_fast(&self, job: &ClaimedJob) -> CycleOutcome {
        tracing::warn!(
            tries = self.config.tries,
            "Retry budget exhausted, failing job without running it"
        );

        match self.store.set_status(&job.id, Status::Failed).await {
            Ok(()) => CycleOutcome::FailedFast(job.id),
            Err(e) => {
                log_error(&e.with_field("job_id", job.id), "Failed to update job status");
                CycleOutcome::Aborted
            }
        }
    }

    async fn execute(&self, job: ClaimedJob) -> CycleOutcome {
        let span = Span::current();
        let token = self.root.child_token();
        // Stops the monitor on every path out of this function.
        let guard = token.clone().drop_guard();

        let monitor = Monitor::new(
            self.store.clone(),
            job.id,
            self.config.heartbeat,
            token.clone(),
        );
        let monitor = AbortOnDropHandle::new(tokio::spawn(monitor.run().instrument(span.clone())));

        let ctx = JobContext {
            id: job.id,
            lane: job.lane.clone(),
            attempt: job.r#try,
            token: token.clone(),
            span: span.clone(),
        };
        let ok = self.dispatch(ctx, job.payload).await;

        let root_cancelled = self.root.is_cancelled();
        let job_cancelled = token.is_cancelled();

        drop(guard);
        let report = match monitor.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Monitor task failed");
                MonitorReport::default()
            }
        };

        let resolution = resolve(Outcome {
            ok,
            root_cancelled,
            job_cancelled,
            overridden: report.overridden,
            unrecognized: report.unrecognized.is_some(),
        });

        match resolution {
            Resolution::Overridden(status) => {
                tracing::warn!(status = %status, "Unexpected status detected");
            }
            Resolution::Unrecognized => {
                tracing::warn!(
                    status = ?report.unrecognized,
                    "Unrecognized status detected, leaving job untouched"
                );
            }
            Resolution::Abandoned => {
                tracing::debug!("Shutting down, leaving job for reclaim");
            }
            Resolution::Settled(status) => {
                tracing::debug!(status = %status, "Updating job status");
                if let Err(e) = self.store.set_status(&job.id, status).await {
                    log_error(
                        &e.with_field("job_id", job.id).with_field("status", status),
                        "Failed to update job status",
                    );
                    return CycleOutcome::Aborted;
                }
            }
        }

        CycleOutcome::Resolved(job.id, resolution)
    }

    /// Run the handler in its own task so a panic fails the job, not the loop.
    async fn dispatch(&self, ctx: JobContext, payload: Payload) -> bool {
        let span = ctx.span.clone();
        let handle = AbortOnDropHandle::new(tokio::spawn(
            (self.handler)(ctx, payload).instrument(span),
        ));

        match handle.await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(error = %e, "Job handler panicked");
                false
            }
        }
    }
}

/// Heartbeats older than this mark a lease as stale.
fn stale_before(now: DateTime<Utc>, timeout: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
