//! Submit → poll → fetch state machine for asynchronous remote jobs.
//!
//! ```text
//! submit ──▶ Pending ──poll──▶ Pending ... ──▶ Ready ──fetch──▶ artifact
//!                        │                 └─▶ Failed
//!                        └── deadline ───────▶ TimedOut
//! ```
//!
//! Transport hiccups, error statuses and unreadable status documents while
//! polling leave the job `Pending`. The wall-clock ceiling is measured from
//! submission and also bounds rate-budget waits, so a job never outlives it
//! by more than one in-flight request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::http_client::HttpRequest;
use crate::protocol::{JobPollReport, Protocol, RemoteJobId, ResultLocation};
use crate::rate_budget::ServiceFamily;
use crate::retry::PollSchedule;
use crate::transport::{snippet, GatedTransport, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Ready,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One submitted job, owned by the call chain that submitted it.
#[derive(Debug)]
pub struct Job {
    request: HttpRequest,
    remote_id: RemoteJobId,
    submitted_at: Instant,
    status: JobStatus,
    result_location: Option<ResultLocation>,
    failure: Option<String>,
    poll_attempts: u32,
}

impl Job {
    /// The submission request, kept for diagnostics.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn remote_id(&self) -> &RemoteJobId {
        &self.remote_id
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result_location(&self) -> Option<&ResultLocation> {
        self.result_location.as_ref()
    }

    /// Server-reported reason of a `Failed` job.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Status checks actually sent to the server.
    pub fn poll_attempts(&self) -> u32 {
        self.poll_attempts
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.submitted_at)
    }

    fn time_out(&mut self) -> JobStatus {
        if self.status != JobStatus::TimedOut {
            warn!(
                job_id = %self.remote_id,
                elapsed_ms = self.elapsed().as_millis() as u64,
                poll_attempts = self.poll_attempts,
                "job timed out"
            );
            self.status = JobStatus::TimedOut;
        }
        self.status
    }
}

/// Terminal result of [`JobEngine::run`].
///
/// `TimedOut` is an outcome, not an error: the job may still finish on the
/// server later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum JobOutcome<T> {
    Ready(T),
    Failed {
        job_id: RemoteJobId,
        reason: String,
    },
    TimedOut {
        job_id: RemoteJobId,
        elapsed: Duration,
        poll_attempts: u32,
    },
}

impl<T> JobOutcome<T> {
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> JobOutcome<U> {
        match self {
            Self::Ready(value) => JobOutcome::Ready(f(value)),
            Self::Failed { job_id, reason } => JobOutcome::Failed { job_id, reason },
            Self::TimedOut {
                job_id,
                elapsed,
                poll_attempts,
            } => JobOutcome::TimedOut {
                job_id,
                elapsed,
                poll_attempts,
            },
        }
    }

    pub fn try_map<U, E, F>(self, f: F) -> Result<JobOutcome<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        match self {
            Self::Ready(value) => f(value).map(JobOutcome::Ready),
            Self::Failed { job_id, reason } => Ok(JobOutcome::Failed { job_id, reason }),
            Self::TimedOut {
                job_id,
                elapsed,
                poll_attempts,
            } => Ok(JobOutcome::TimedOut {
                job_id,
                elapsed,
                poll_attempts,
            }),
        }
    }

    /// Turns non-ready outcomes into `JobFailed` / `JobTimedOut` errors.
    pub fn into_result(self) -> Result<T, GatewayError> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Failed { job_id, reason } => Err(GatewayError::JobFailed { job_id, reason }),
            Self::TimedOut {
                job_id,
                elapsed,
                poll_attempts,
            } => Err(GatewayError::JobTimedOut {
                job_id,
                elapsed,
                poll_attempts,
            }),
        }
    }
}

/// Drives jobs through the PubChem rate budget.
#[derive(Clone)]
pub struct JobEngine {
    transport: GatedTransport,
    protocol: Arc<dyn Protocol>,
    schedule: PollSchedule,
}

impl JobEngine {
    const FAMILY: ServiceFamily = ServiceFamily::PubChem;

    pub fn new(transport: GatedTransport, protocol: Arc<dyn Protocol>, schedule: PollSchedule) -> Self {
        Self {
            transport,
            protocol,
            schedule,
        }
    }

    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    /// Sends a job-creating request and reads the job id from the reply.
    pub async fn submit(&self, request: HttpRequest) -> Result<Job, GatewayError> {
        let response = self
            .transport
            .send(Self::FAMILY, request.clone(), None)
            .await
            .map_err(|error| error.into_gateway(|message| GatewayError::Submission { message }))?;

        let remote_id =
            self.protocol
                .job_id(&response.body)
                .ok_or_else(|| GatewayError::Submission {
                    message: format!("no job id in response: {}", snippet(&response.body)),
                })?;
        info!(job_id = %remote_id, "job submitted");

        Ok(Job {
            request,
            remote_id,
            submitted_at: Instant::now(),
            status: JobStatus::Pending,
            result_location: None,
            failure: None,
            poll_attempts: 0,
        })
    }

    fn deadline(&self, job: &Job) -> Instant {
        job.submitted_at + self.schedule.timeout
    }

    /// One status check. Terminal jobs are returned as-is without a call.
    pub async fn poll(&self, job: &mut Job) -> Result<JobStatus, GatewayError> {
        if job.status.is_terminal() {
            return Ok(job.status);
        }
        let deadline = self.deadline(job);
        if Instant::now() >= deadline {
            return Ok(job.time_out());
        }

        let request = self.protocol.status_request(&job.remote_id);
        let result = self.transport.send(Self::FAMILY, request, Some(deadline)).await;
        let response = match result {
            Ok(response) => {
                job.poll_attempts += 1;
                response
            }
            Err(SendError::Admission(GatewayError::AdmissionTimeout { .. })) => {
                return Ok(job.time_out());
            }
            Err(SendError::Admission(error)) => return Err(error),
            Err(error) => {
                job.poll_attempts += 1;
                debug!(
                    job_id = %job.remote_id,
                    attempt = job.poll_attempts,
                    error = ?error,
                    "status check failed; job stays pending"
                );
                return Ok(job.status);
            }
        };

        match self.protocol.job_status(&response.body) {
            JobPollReport::Ready(location) => {
                info!(job_id = %job.remote_id, location = %location, "job ready");
                job.result_location = Some(location);
                job.status = JobStatus::Ready;
            }
            JobPollReport::Failed(reason) => {
                warn!(job_id = %job.remote_id, reason = %reason, "job failed");
                job.failure = Some(reason);
                job.status = JobStatus::Failed;
            }
            JobPollReport::Pending => {
                debug!(job_id = %job.remote_id, attempt = job.poll_attempts, "job pending");
            }
        }
        Ok(job.status)
    }

    /// Polls until the job is terminal or its ceiling passes.
    pub async fn wait(&self, job: &mut Job) -> Result<JobStatus, GatewayError> {
        let deadline = self.deadline(job);
        sleep_until((job.submitted_at + self.schedule.initial_delay).min(deadline)).await;

        let mut attempt = 0;
        loop {
            let status = self.poll(job).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(job.time_out());
            }
            sleep(self.schedule.delay_after(attempt).min(remaining)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Downloads the artifact of a `Ready` job. Failures are not retried.
    pub async fn fetch(&self, job: &Job) -> Result<String, GatewayError> {
        let location = match (job.status, job.result_location.as_ref()) {
            (JobStatus::Ready, Some(location)) => location,
            _ => {
                return Err(GatewayError::Fetch {
                    location: String::new(),
                    message: format!("job {} is {:?}, not ready", job.remote_id, job.status),
                })
            }
        };

        let response = self
            .transport
            .send(Self::FAMILY, self.protocol.download(location), None)
            .await
            .map_err(|error| {
                error.into_gateway(|message| GatewayError::Fetch {
                    location: location.to_string(),
                    message,
                })
            })?;
        debug!(job_id = %job.remote_id, bytes = response.body.len(), "job result fetched");
        Ok(response.body)
    }

    /// Submit, wait, and fetch on success.
    pub async fn run(&self, request: HttpRequest) -> Result<JobOutcome<String>, GatewayError> {
        let mut job = self.submit(request).await?;
        match self.wait(&mut job).await? {
            JobStatus::Ready => self.fetch(&job).await.map(JobOutcome::Ready),
            JobStatus::Failed => Ok(JobOutcome::Failed {
                reason: job.failure.take().unwrap_or_default(),
                job_id: job.remote_id,
            }),
            JobStatus::TimedOut | JobStatus::Pending => Ok(JobOutcome::TimedOut {
                elapsed: job.elapsed(),
                poll_attempts: job.poll_attempts,
                job_id: job.remote_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Ready.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
    }

    #[test]
    fn timed_out_outcome_becomes_typed_error() {
        let outcome: JobOutcome<String> = JobOutcome::TimedOut {
            job_id: RemoteJobId::new("7"),
            elapsed: Duration::from_secs(30),
            poll_attempts: 3,
        };

        let error = outcome.into_result().expect_err("timed out");

        assert!(matches!(
            error,
            GatewayError::JobTimedOut {
                poll_attempts: 3,
                ..
            }
        ));
    }

    #[test]
    fn try_map_only_touches_ready_values() {
        let ready: JobOutcome<&str> = JobOutcome::Ready("12");
        assert_eq!(
            ready.try_map(|body| body.parse::<u32>()),
            Ok(JobOutcome::Ready(12))
        );

        let failed: JobOutcome<&str> = JobOutcome::Failed {
            job_id: RemoteJobId::new("9"),
            reason: String::from("input-error"),
        };
        let mapped = failed.try_map(|body| body.parse::<u32>()).expect("not parsed");
        assert!(!mapped.is_ready());
    }
}
