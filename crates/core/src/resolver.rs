//! Final status resolution for an executed job.

use crate::job::Status;

/// Everything known about a job once its handler has returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Handler result.
    pub ok: bool,
    /// The worker is shutting down.
    pub root_cancelled: bool,
    /// The job's own token was cancelled (request, deletion or override).
    pub job_cancelled: bool,
    /// Status written over ours while the handler ran.
    pub overridden: Option<Status>,
    /// Status text written over ours that is not a known status.
    pub unrecognized: bool,
}

/// What to do with the job row after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Someone else settled the job. Nothing is written.
    Overridden(Status),
    /// Someone else wrote a status this crate cannot parse. Nothing is written.
    Unrecognized,
    /// Write this status.
    Settled(Status),
    /// Shutdown interrupted a failing job. The row stays `running` and is
    /// reclaimed once its heartbeat goes stale.
    Abandoned,
}

impl Resolution {
    /// The status to persist, if any.
    pub fn status_to_persist(&self) -> Option<Status> {
        match self {
            Resolution::Settled(status) => Some(*status),
            Resolution::Overridden(_) | Resolution::Unrecognized | Resolution::Abandoned => None,
        }
    }
}

/// Map an execution outcome to a resolution.
///
/// Foreign overrides come first, then success, shutdown, job cancellation
/// and finally failure.
pub fn resolve(outcome: Outcome) -> Resolution {
    match outcome {
        Outcome {
            overridden: Some(status),
            ..
        } if status != Status::Running => Resolution::Overridden(status),
        Outcome {
            unrecognized: true,
            ..
        } => Resolution::Unrecognized,
        Outcome { ok: true, .. } => Resolution::Settled(Status::Succeeded),
        Outcome {
            root_cancelled: true,
            ..
        } => Resolution::Abandoned,
        Outcome {
            job_cancelled: true,
            ..
        } => Resolution::Settled(Status::Cancelled),
        _ => Resolution::Settled(Status::Failed),
    }
}
