//! Remote job submission with fire-and-poll and blocking-sync protocols.

use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{ComputeBackend, Job, JobStatus};
use crate::cancel::cancellable;

/// Interval between status checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Longest a fire-and-poll job may take before it is abandoned.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(300);
/// Server-side wait for the blocking protocol; generous enough to absorb
/// cold starts.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors raised while running remote jobs.
#[derive(Debug, Error)]
pub enum JobError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the job cannot be queued.
    #[error("failed to submit job: {0}")]
    Submit(#[source] E),
    /// Raised when the blocking call fails in transport.
    #[error("blocking job request failed: {0}")]
    Sync(#[source] E),
    /// Raised when the provider reports the job as failed.
    #[error("job {job_id} failed: {message}")]
    Failed {
        /// Provider job identifier.
        job_id: String,
        /// Provider error message, passed through verbatim.
        message: String,
    },
    /// Raised when polling exceeds the maximum wait.
    #[error("job {job_id} did not finish within {} seconds", waited.as_secs())]
    Timeout {
        /// Provider job identifier.
        job_id: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// Raised when the blocking call returns before the job finished.
    #[error("job {job_id} still {status} when the blocking call returned")]
    Incomplete {
        /// Provider job identifier.
        job_id: String,
        /// Last reported phase.
        status: &'static str,
    },
    /// Raised when the caller cancels.
    #[error("job cancelled")]
    Cancelled,
}

/// Progress observer receiving the phase name and elapsed time.
pub type Progress<'a> = &'a mut (dyn FnMut(&str, Duration) + Send);

/// Runs jobs against a [`ComputeBackend`].
#[derive(Clone, Debug)]
pub struct JobClient<B> {
    backend: B,
    poll_interval: Duration,
    max_wait: Duration,
    sync_timeout: Duration,
}

impl<B> JobClient<B>
where
    B: ComputeBackend,
{
    /// Creates a client with the default timings.
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            poll_interval: POLL_INTERVAL,
            max_wait: MAX_POLL_WAIT,
            sync_timeout: SYNC_TIMEOUT,
        }
    }

    /// Overrides the poll interval.
    ///
    /// This is primarily used by tests to keep polling scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the maximum poll wait.
    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Overrides the blocking-call timeout.
    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Returns the underlying backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Queues a job and polls until it reaches a terminal status.
    ///
    /// Transport or decode errors while polling are logged and retried on
    /// the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Submit`] when queueing fails,
    /// [`JobError::Failed`] when the provider reports failure,
    /// [`JobError::Timeout`] once the maximum wait elapses, and
    /// [`JobError::Cancelled`] when `cancel` fires.
    pub async fn submit_and_poll(
        &self,
        endpoint_id: &str,
        input: &Value,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<Job, JobError<B::Error>> {
        let job_id = cancellable(
            cancel,
            async {
                self.backend
                    .submit_job(endpoint_id, input)
                    .await
                    .map_err(JobError::Submit)
            },
            || JobError::Cancelled,
        )
        .await?;
        info!(endpoint_id, job_id = %job_id, "job submitted");

        let started = Instant::now();
        loop {
            let observed = cancellable(
                cancel,
                async { Ok(self.backend.job_status(endpoint_id, &job_id).await) },
                || JobError::Cancelled,
            )
            .await?;
            match observed {
                Ok(job) => {
                    progress(job.status.phase(), started.elapsed());
                    match job.status {
                        JobStatus::Completed => return Ok(job),
                        JobStatus::Failed => return Err(failed(job)),
                        JobStatus::Queued | JobStatus::InProgress => {}
                    }
                }
                Err(err) => debug!(job_id = %job_id, error = %err, "status check failed; retrying"),
            }

            if started.elapsed() >= self.max_wait {
                return Err(JobError::Timeout {
                    job_id,
                    waited: started.elapsed(),
                });
            }
            cancellable(
                cancel,
                async {
                    sleep(self.poll_interval).await;
                    Ok(())
                },
                || JobError::Cancelled,
            )
            .await?;
        }
    }

    /// Runs a job with a single blocking call. There is no retry: the call
    /// is already one long-lived attempt.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Sync`] on transport failure, [`JobError::Failed`]
    /// when the job fails, [`JobError::Incomplete`] when the call returns
    /// before the job finishes, and [`JobError::Cancelled`] when `cancel`
    /// fires.
    pub async fn run_sync(
        &self,
        endpoint_id: &str,
        input: &Value,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<Job, JobError<B::Error>> {
        progress(JobStatus::Queued.phase(), Duration::ZERO);
        let started = Instant::now();
        let job = cancellable(
            cancel,
            async {
                self.backend
                    .run_sync(endpoint_id, input, self.sync_timeout)
                    .await
                    .map_err(JobError::Sync)
            },
            || JobError::Cancelled,
        )
        .await?;
        match job.status {
            JobStatus::Completed => {
                progress(JobStatus::Completed.phase(), started.elapsed());
                info!(endpoint_id, job_id = %job.id, "job completed");
                Ok(job)
            }
            JobStatus::Failed => Err(failed(job)),
            other => Err(JobError::Incomplete {
                job_id: job.id,
                status: other.phase(),
            }),
        }
    }
}

fn failed<E: std::error::Error + 'static>(job: Job) -> JobError<E> {
    JobError::Failed {
        message: job
            .error
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| String::from("unknown error")),
        job_id: job.id,
    }
}
