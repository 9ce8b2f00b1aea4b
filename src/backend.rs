//! Compute-provider abstraction for serverless endpoints and their jobs.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::cost::{self, BillingMode};

/// Fallback maximum worker count for new endpoints.
pub const DEFAULT_WORKERS_MAX: u32 = 1;
/// Seconds an idle worker stays warm before scaling down.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 5;

/// A remote compute deployment capable of running jobs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Endpoint {
    /// Provider identifier.
    pub id: String,
    /// Human readable name; matched by prefix during lookup.
    pub name: String,
    /// Acceptable compute classes in preference order.
    pub compute_classes: Vec<String>,
    /// Workers kept warm at all times.
    pub workers_min: u32,
    /// Upper bound on concurrent workers.
    pub workers_max: u32,
    /// Attached network volumes, primary first.
    pub volume_ids: Vec<String>,
}

impl Endpoint {
    /// Returns the volume a job on this endpoint would see mounted.
    #[must_use]
    pub fn primary_volume(&self) -> Option<&str> {
        self.volume_ids.first().map(String::as_str)
    }

    /// Billing mode implied by the endpoint's warm worker count.
    #[must_use]
    pub const fn billing_mode(&self) -> BillingMode {
        BillingMode::from_workers_min(self.workers_min)
    }

    /// Per-second rate for this endpoint.
    #[must_use]
    pub fn rate(&self) -> f64 {
        cost::rate(&self.compute_classes, self.workers_min)
    }
}

/// Parameters for provisioning a new endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndpointSpec {
    /// Endpoint name.
    pub name: String,
    /// Provider template that defines the worker image.
    pub template_id: String,
    /// Acceptable compute classes in preference order.
    pub compute_classes: Vec<String>,
    /// Accelerators per worker.
    pub gpu_count: u32,
    /// Data centres the provider may place workers in.
    pub data_centers: Vec<String>,
    /// Workers kept warm at all times.
    pub workers_min: u32,
    /// Upper bound on concurrent workers.
    pub workers_max: u32,
    /// Seconds before an idle worker is released.
    pub idle_timeout_secs: u32,
    /// Enables the provider's fast cold-start snapshotting.
    pub flashboot: bool,
    /// Network volume to mount into every worker.
    pub volume_id: Option<String>,
}

impl EndpointSpec {
    /// Starts a builder for an [`EndpointSpec`].
    #[must_use]
    pub fn builder() -> EndpointSpecBuilder {
        EndpointSpecBuilder::new()
    }

    /// Validates the spec.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a required field is empty or
    /// the worker bounds are inconsistent.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.name.is_empty() {
            return Err(BackendError::Validation("name".to_owned()));
        }
        if self.template_id.is_empty() {
            return Err(BackendError::Validation("template_id".to_owned()));
        }
        if self.compute_classes.is_empty() {
            return Err(BackendError::Validation("compute_classes".to_owned()));
        }
        if self.workers_max < self.workers_min || self.workers_max == 0 {
            return Err(BackendError::Validation("workers_max".to_owned()));
        }
        Ok(())
    }

    /// Returns a copy that mounts `volume_id`.
    #[must_use]
    pub fn with_volume(&self, volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: Some(volume_id.into()),
            ..self.clone()
        }
    }
}

/// Builder for [`EndpointSpec`] that trims inputs and validates on build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndpointSpecBuilder {
    name: String,
    template_id: String,
    compute_classes: Vec<String>,
    gpu_count: u32,
    data_centers: Vec<String>,
    workers_min: u32,
    workers_max: u32,
    idle_timeout_secs: u32,
    flashboot: bool,
    volume_id: Option<String>,
}

impl Default for EndpointSpecBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            template_id: String::new(),
            compute_classes: Vec::new(),
            gpu_count: 1,
            data_centers: Vec::new(),
            workers_min: 0,
            workers_max: DEFAULT_WORKERS_MAX,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            flashboot: true,
            volume_id: None,
        }
    }
}

impl EndpointSpecBuilder {
    /// Creates a builder with provider defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the endpoint name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the worker template.
    #[must_use]
    pub fn template_id(mut self, value: impl Into<String>) -> Self {
        self.template_id = value.into();
        self
    }

    /// Sets the acceptable compute classes.
    #[must_use]
    pub fn compute_classes(mut self, value: Vec<String>) -> Self {
        self.compute_classes = value;
        self
    }

    /// Sets accelerators per worker.
    #[must_use]
    pub const fn gpu_count(mut self, value: u32) -> Self {
        self.gpu_count = value;
        self
    }

    /// Sets the permitted data centres.
    #[must_use]
    pub fn data_centers(mut self, value: Vec<String>) -> Self {
        self.data_centers = value;
        self
    }

    /// Sets the warm worker count.
    #[must_use]
    pub const fn workers_min(mut self, value: u32) -> Self {
        self.workers_min = value;
        self
    }

    /// Sets the maximum worker count.
    #[must_use]
    pub const fn workers_max(mut self, value: u32) -> Self {
        self.workers_max = value;
        self
    }

    /// Sets the idle timeout in seconds.
    #[must_use]
    pub const fn idle_timeout_secs(mut self, value: u32) -> Self {
        self.idle_timeout_secs = value;
        self
    }

    /// Enables or disables fast start.
    #[must_use]
    pub const fn flashboot(mut self, value: bool) -> Self {
        self.flashboot = value;
        self
    }

    /// Sets the volume to mount.
    #[must_use]
    pub fn volume_id(mut self, value: Option<String>) -> Self {
        self.volume_id = value;
        self
    }

    /// Builds and validates the [`EndpointSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a required field is empty.
    pub fn build(self) -> Result<EndpointSpec, BackendError> {
        let spec = EndpointSpec {
            name: self.name.trim().to_owned(),
            template_id: self.template_id.trim().to_owned(),
            compute_classes: trimmed(self.compute_classes),
            gpu_count: self.gpu_count.max(1),
            data_centers: trimmed(self.data_centers),
            workers_min: self.workers_min,
            workers_max: self.workers_max.max(self.workers_min),
            idle_timeout_secs: self.idle_timeout_secs,
            flashboot: self.flashboot,
            volume_id: self
                .volume_id
                .map(|id| id.trim().to_owned())
                .filter(|id| !id.is_empty()),
        };
        spec.validate()?;
        Ok(spec)
    }
}

fn trimmed(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .collect()
}

/// Lifecycle state of a remote job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker is processing the job.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully (including provider-side cancellation or
    /// timeout).
    Failed,
}

impl JobStatus {
    /// Returns `true` once the provider will not change the status again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Progress phase reported to callbacks.
    #[must_use]
    pub const fn phase(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Uniform result of a remote job, whichever protocol produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    /// Provider job identifier.
    pub id: String,
    /// Latest status.
    pub status: JobStatus,
    /// Time spent queued or cold-starting.
    pub delay_time: Duration,
    /// Time spent actively processing.
    pub execution_time: Duration,
    /// Handler output payload, when present.
    pub output: Option<Value>,
    /// Provider error message for failed jobs.
    pub error: Option<String>,
}

impl Job {
    /// Creates a job snapshot with no timing or output yet.
    #[must_use]
    pub fn pending(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            delay_time: Duration::ZERO,
            execution_time: Duration::ZERO,
            output: None,
            error: None,
        }
    }

    /// Looks up a string field in the output payload.
    #[must_use]
    pub fn output_str(&self, key: &str) -> Option<&str> {
        self.output.as_ref()?.get(key)?.as_str()
    }
}

/// Worker and queue counters for an endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EndpointHealth {
    /// Workers idling warm.
    pub workers_idle: u32,
    /// Workers currently running a job.
    pub workers_running: u32,
    /// Jobs waiting for a worker.
    pub jobs_in_queue: u32,
    /// Jobs being processed.
    pub jobs_in_progress: u32,
    /// Jobs completed recently.
    pub jobs_completed: u32,
    /// Jobs failed recently.
    pub jobs_failed: u32,
}

/// Errors raised while validating backend requests.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when a volume request is smaller than the provider allows.
    #[error("volume size {requested} GB is below the {minimum} GB minimum")]
    VolumeTooSmall {
        /// Size requested by the caller.
        requested: u32,
        /// Provider minimum.
        minimum: u32,
    },
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Interface implemented by serverless compute providers.
pub trait ComputeBackend: Send + Sync {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists every endpoint owned by the credential.
    fn list_endpoints(&self) -> BackendFuture<'_, Vec<Endpoint>, Self::Error>;

    /// Creates an endpoint.
    fn create_endpoint<'a>(
        &'a self,
        spec: &'a EndpointSpec,
    ) -> BackendFuture<'a, Endpoint, Self::Error>;

    /// Deletes an endpoint.
    fn delete_endpoint<'a>(&'a self, endpoint_id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Queues a job and returns its identifier.
    fn submit_job<'a>(
        &'a self,
        endpoint_id: &'a str,
        input: &'a Value,
    ) -> BackendFuture<'a, String, Self::Error>;

    /// Fetches the current state of a queued job.
    fn job_status<'a>(
        &'a self,
        endpoint_id: &'a str,
        job_id: &'a str,
    ) -> BackendFuture<'a, Job, Self::Error>;

    /// Runs a job in a single call that blocks until it finishes or
    /// `timeout` elapses server-side.
    fn run_sync<'a>(
        &'a self,
        endpoint_id: &'a str,
        input: &'a Value,
        timeout: Duration,
    ) -> BackendFuture<'a, Job, Self::Error>;

    /// Asks the provider to cancel a queued or running job.
    fn cancel_job<'a>(
        &'a self,
        endpoint_id: &'a str,
        job_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Reports worker and queue counters.
    fn endpoint_health<'a>(
        &'a self,
        endpoint_id: &'a str,
    ) -> BackendFuture<'a, EndpointHealth, Self::Error>;
}
