//! Per-job heartbeat monitor.
//!
//! While a handler runs, the monitor refreshes the job's `heartbeat_at` every
//! interval so other workers keep treating the lease as live, and watches the
//! status it reads back. A `cancelling` status, any status written by someone
//! else (including one this crate cannot parse) and a deleted row all cancel
//! the job's token.

use chrono::Utc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{log_error, QueueError};
use crate::job::{JobId, Status};
use crate::store::Store;

/// What the monitor observed before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Last status written over ours by someone else, if any.
    pub overridden: Option<Status>,
    /// Status text written by someone else that is not a known status.
    pub unrecognized: Option<String>,
    /// The job row disappeared.
    pub vanished: bool,
    /// A `cancelling` status was seen.
    pub cancel_requested: bool,
    /// Heartbeats successfully written.
    pub beats: u64,
}

/// Heartbeat monitor for a single claimed job.
pub struct Monitor<S: Store> {
    store: S,
    job_id: JobId,
    interval: Duration,
    token: CancellationToken,
}

impl<S: Store + Clone + 'static> Monitor<S> {
    /// Create a monitor bound to the job's token.
    pub fn new(store: S, job_id: JobId, interval: Duration, token: CancellationToken) -> Self {
        Self {
            store,
            job_id,
            interval,
            token,
        }
    }

    /// Run until the job token is cancelled.
    ///
    /// The first heartbeat is sent one interval after start, the claim having
    /// just stamped the row.
    pub async fn run(self) -> MonitorReport {
        let mut report = MonitorReport::default();

        let mut interval = time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::debug!(job_id = %self.job_id, "Closing monitor");
                    break;
                }
                _ = interval.tick() => {}
            }

            let status = match self.store.heartbeat(&self.job_id, Utc::now()).await {
                Ok(Some(status)) => status,
                Ok(None) => {
                    tracing::debug!(job_id = %self.job_id, "Job row vanished, cancelling");
                    report.vanished = true;
                    self.token.cancel();
                    break;
                }
                Err(e) => {
                    if let QueueError::InvalidStatus(raw) = e.root() {
                        tracing::warn!(
                            job_id = %self.job_id,
                            status = %raw,
                            "Unrecognized status detected"
                        );
                        report.unrecognized = Some(raw.clone());
                        self.token.cancel();
                        break;
                    }
                    log_error(
                        &e.with_field("job_id", self.job_id),
                        "Failed to monitor job status",
                    );
                    continue;
                }
            };

            report.beats += 1;

            match status {
                Status::Running => {
                    tracing::trace!(job_id = %self.job_id, "Heartbeat sent");
                }
                Status::Cancelling => {
                    tracing::debug!(job_id = %self.job_id, "Cancellation detected");
                    report.cancel_requested = true;
                    self.token.cancel();
                }
                other => {
                    tracing::debug!(
                        job_id = %self.job_id,
                        status = %other,
                        "Status override detected"
                    );
                    report.overridden = Some(other);
                    self.token.cancel();
                }
            }
        }

        report
    }
}
