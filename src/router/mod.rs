//! Dispatches operations to the local engine or a remote provider.
//!
//! Unsupported provider and operation pairs are rejected before any
//! subprocess or network call. Each successful path writes exactly one
//! output artifact and reports the timings the cost model needs.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BackendFuture, Endpoint, EndpointSpec};
use crate::batch::{FileJob, FileProcessor};
use crate::cancel::cancellable;
use crate::config::ConfigError;
use crate::cost::{self, BillingMode};
use crate::endpoint::{
    DEFAULT_IMAGE_MODEL, EndpointError, EndpointManager, FFMPEG_MODEL, ModelKind,
    endpoint_name_for_model, provision_spec,
};
use crate::engine::{Acceleration, EngineError, LocalEngine, MediaRunner};
use crate::job::{JobClient, JobError, Progress};
use crate::object_store::{ObjectTransfer, discard_partial};
use crate::operation::{Operation, OperationError, Transform};
use crate::prediction::{self, PredictionBackend, PredictionUpscaler, UpscaleError};
use crate::volume::VolumeBackend;
use crate::workflow::{VolumeJob, VolumeRef, VolumeWorkflow, WorkflowError, WorkflowSettings};

/// Where an operation runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provider {
    /// Local engine, software codecs.
    LocalCpu,
    /// Local engine with hardware acceleration.
    LocalGpu,
    /// Serverless GPU endpoints.
    RemoteServerless,
    /// Hosted prediction API.
    RemotePrediction,
}

impl Provider {
    /// Every provider, in display order.
    pub const ALL: [Self; 4] = [
        Self::LocalCpu,
        Self::LocalGpu,
        Self::RemoteServerless,
        Self::RemotePrediction,
    ];

    /// Name accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalCpu => "local",
            Self::LocalGpu => "local-gpu",
            Self::RemoteServerless => "runpod",
            Self::RemotePrediction => "replicate",
        }
    }

    /// One-line description for listings.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::LocalCpu => "local media engine with software codecs",
            Self::LocalGpu => "local media engine with CUDA or VideoToolbox acceleration",
            Self::RemoteServerless => "serverless GPU endpoints, inline or via network volume",
            Self::RemotePrediction => "hosted prediction API (upscale only)",
        }
    }

    /// Returns `true` for remote providers.
    #[must_use]
    pub const fn is_remote(self) -> bool {
        matches!(self, Self::RemoteServerless | Self::RemotePrediction)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "local-cpu" | "cpu" => Ok(Self::LocalCpu),
            "local-gpu" | "gpu" => Ok(Self::LocalGpu),
            "runpod" | "serverless" => Ok(Self::RemoteServerless),
            "replicate" | "prediction" => Ok(Self::RemotePrediction),
            other => Err(ConfigError::Unsupported(format!(
                "unknown provider '{other}' (expected local, local-gpu, runpod or replicate)"
            ))),
        }
    }
}

/// Provider choice plus the settings scoped to it, fixed for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSelection {
    /// Target provider.
    pub provider: Provider,
    /// Remote model; derived from the operation when unset.
    pub model: Option<String>,
    /// Network volume request for the serverless provider.
    pub volume: VolumeRef,
    /// Preferred compute class for new endpoints.
    pub compute_class: Option<String>,
    /// Preferred data centres; the first one hosts fresh volumes.
    pub data_centers: Vec<String>,
    /// Warm workers for newly provisioned endpoints.
    pub workers_min: u32,
    /// Leaves fresh volumes in place when a run fails.
    pub keep_on_failure: bool,
}

impl ProviderSelection {
    /// Selection with no provider-specific settings.
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model: None,
            volume: VolumeRef::default(),
            compute_class: None,
            data_centers: Vec::new(),
            workers_min: 0,
            keep_on_failure: false,
        }
    }

    fn model_for(&self, transform: &Transform) -> String {
        self.model.clone().unwrap_or_else(|| match transform {
            Transform::Upscale { .. } => DEFAULT_IMAGE_MODEL.to_owned(),
            _ => FFMPEG_MODEL.to_owned(),
        })
    }
}

/// Timings and rate for one executed operation.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionOutcome {
    /// Provider that ran the operation.
    pub provider: Provider,
    /// Output artifact.
    pub output: Utf8PathBuf,
    /// Size of the output artifact; zero for directory outputs.
    pub bytes_written: u64,
    /// Client-measured wall time.
    pub wall_time: Duration,
    /// Processing time reported by the provider.
    pub execution_time: Duration,
    /// Per-second rate; zero for local runs.
    pub rate: f64,
    /// Billing mode the rate applies to.
    pub billing_mode: BillingMode,
}

impl ExecutionOutcome {
    /// Estimated cost of this run.
    #[must_use]
    pub fn cost(&self) -> f64 {
        let billed = self
            .billing_mode
            .billable_duration(self.wall_time, self.execution_time);
        cost::billed_cost(billed, self.rate, self.billing_mode)
    }
}

/// Errors raised while routing an operation.
#[derive(Debug, Error)]
pub enum RouteError<E, P>
where
    E: std::error::Error + 'static,
    P: std::error::Error + 'static,
{
    /// Raised for unsupported provider, model or operation combinations.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised for invalid operation parameters.
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// Raised by the local engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Raised when the input or output file cannot be accessed.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// OS error message.
        message: String,
    },
    /// Raised when no endpoint is available.
    #[error(transparent)]
    Endpoint(EndpointError<E>),
    /// Raised when the remote job fails.
    #[error(transparent)]
    Job(JobError<E>),
    /// Raised when a completed job carries no decodable output.
    #[error("job {job_id} returned no usable output: {message}")]
    InvalidOutput {
        /// Provider job identifier.
        job_id: String,
        /// Description of the problem.
        message: String,
    },
    /// Raised by the network volume workflow.
    #[error(transparent)]
    Workflow(WorkflowError<E>),
    /// Raised by the prediction API.
    #[error(transparent)]
    Prediction(UpscaleError<P>),
    /// Raised when the caller cancels.
    #[error("operation cancelled")]
    Cancelled,
}

impl<E, P> RouteError<E, P>
where
    E: std::error::Error + 'static,
    P: std::error::Error + 'static,
{
    fn io(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl<E: std::error::Error + 'static, P: std::error::Error + 'static> From<EndpointError<E>>
    for RouteError<E, P>
{
    fn from(value: EndpointError<E>) -> Self {
        match value {
            EndpointError::Cancelled => Self::Cancelled,
            other => Self::Endpoint(other),
        }
    }
}

impl<E: std::error::Error + 'static, P: std::error::Error + 'static> From<JobError<E>>
    for RouteError<E, P>
{
    fn from(value: JobError<E>) -> Self {
        match value {
            JobError::Cancelled => Self::Cancelled,
            other => Self::Job(other),
        }
    }
}

impl<E: std::error::Error + 'static, P: std::error::Error + 'static> From<WorkflowError<E>>
    for RouteError<E, P>
{
    fn from(value: WorkflowError<E>) -> Self {
        match value {
            WorkflowError::Cancelled => Self::Cancelled,
            other => Self::Workflow(other),
        }
    }
}

impl<E: std::error::Error + 'static, P: std::error::Error + 'static> From<UpscaleError<P>>
    for RouteError<E, P>
{
    fn from(value: UpscaleError<P>) -> Self {
        match value {
            UpscaleError::Cancelled => Self::Cancelled,
            other => Self::Prediction(other),
        }
    }
}

/// Rejects combinations the chosen provider cannot run.
///
/// # Errors
///
/// Returns [`ConfigError::Unsupported`] naming the operation, model and
/// provider.
pub fn check_supported(transform: &Transform, selection: &ProviderSelection) -> Result<(), ConfigError> {
    let model = selection.model_for(transform);
    let unsupported = |reason: &str| {
        Err(ConfigError::Unsupported(format!(
            "{} on {}: {reason}",
            transform.name(),
            selection.provider
        )))
    };
    match selection.provider {
        Provider::LocalCpu | Provider::LocalGpu => Ok(()),
        Provider::RemoteServerless => {
            if transform.is_local_only() || matches!(transform, Transform::Transcode(_)) {
                return unsupported("only single-input filter and argument operations run remotely");
            }
            let wants_image_model = matches!(transform, Transform::Upscale { .. });
            match (ModelKind::of(&model), wants_image_model) {
                (ModelKind::Image, true) | (ModelKind::Ffmpeg, false) => Ok(()),
                (ModelKind::Ffmpeg, true) => unsupported("upscale needs an image model"),
                (ModelKind::Image, false) => {
                    unsupported(&format!("model '{model}' only performs upscaling"))
                }
            }
        }
        Provider::RemotePrediction => {
            if !matches!(transform, Transform::Upscale { .. }) {
                return unsupported("the prediction API only performs upscaling");
            }
            prediction::model_path(&model).map(drop).or_else(|reason| unsupported(&reason))
        }
    }
}

struct Serverless<B, T> {
    endpoints: EndpointManager<B>,
    jobs: JobClient<B>,
    workflow: Option<VolumeWorkflow<B, T>>,
}

/// Routes operations to the configured execution paths.
pub struct ExecutionRouter<R, B, T, P>
where
    R: MediaRunner,
{
    engine: LocalEngine<R>,
    serverless: Option<Serverless<B, T>>,
    prediction: Option<PredictionUpscaler<P>>,
    endpoint_prefix: String,
    default_data_center: String,
}

impl<R, B, T, P> ExecutionRouter<R, B, T, P>
where
    R: MediaRunner,
    B: VolumeBackend + Clone,
    T: ObjectTransfer,
    P: PredictionBackend,
{
    /// Creates a router that can only run locally until remote providers
    /// are attached.
    #[must_use]
    pub fn new(
        engine: LocalEngine<R>,
        endpoint_prefix: impl Into<String>,
        default_data_center: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            serverless: None,
            prediction: None,
            endpoint_prefix: endpoint_prefix.into(),
            default_data_center: default_data_center.into(),
        }
    }

    /// Attaches the serverless provider. Without `transfer` the volume
    /// workflow is unavailable.
    #[must_use]
    pub fn with_serverless(mut self, backend: B, transfer: Option<T>) -> Self {
        self.serverless = Some(Serverless {
            endpoints: EndpointManager::new(backend.clone()),
            jobs: JobClient::new(backend.clone()),
            workflow: transfer.map(|store| VolumeWorkflow::new(backend, store)),
        });
        self
    }

    /// Attaches the prediction provider.
    #[must_use]
    pub fn with_prediction(mut self, backend: P) -> Self {
        self.prediction = Some(PredictionUpscaler::new(backend));
        self
    }

    /// Overrides the pause after volume creation.
    ///
    /// This is primarily used by tests to keep scenarios fast.
    #[must_use]
    pub fn with_volume_settle(mut self, settle: Duration) -> Self {
        if let Some(serverless) = self.serverless.as_mut() {
            serverless.workflow = serverless
                .workflow
                .take()
                .map(|workflow| workflow.with_volume_settle(settle));
        }
        self
    }

    /// Runs `operation` on the selected provider.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Config`] for unsupported combinations before
    /// any work starts, and the failing path's error otherwise.
    pub async fn execute(
        &self,
        operation: &Operation,
        selection: &ProviderSelection,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RouteError<B::Error, P::Error>> {
        operation.transform.validate()?;
        check_supported(&operation.transform, selection)?;
        let started = Instant::now();
        info!(
            operation = operation.transform.name(),
            provider = %selection.provider,
            source = %operation.source(),
            "executing operation"
        );

        match selection.provider {
            Provider::LocalCpu => self.run_local(operation, Acceleration::Cpu, started, cancel).await,
            Provider::LocalGpu => self.run_local(operation, Acceleration::Gpu, started, cancel).await,
            Provider::RemoteServerless => {
                let serverless = self.serverless.as_ref().ok_or_else(|| {
                    ConfigError::Unsupported(String::from("serverless provider is not configured"))
                })?;
                if selection.volume.is_requested() {
                    self.run_volume(serverless, operation, selection, started, progress, cancel)
                        .await
                } else {
                    self.run_inline(serverless, operation, selection, started, progress, cancel)
                        .await
                }
            }
            Provider::RemotePrediction => {
                let upscaler = self.prediction.as_ref().ok_or_else(|| {
                    ConfigError::Unsupported(String::from("prediction provider is not configured"))
                })?;
                Self::run_prediction(upscaler, operation, selection, started, cancel).await
            }
        }
    }

    async fn run_local(
        &self,
        operation: &Operation,
        acceleration: Acceleration,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RouteError<B::Error, P::Error>> {
        self.engine.execute(operation, acceleration, cancel).await?;
        let wall_time = started.elapsed();
        let bytes_written = match fs::metadata(operation.destination()).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => 0,
            Err(err) => {
                debug!(path = %operation.destination(), error = %err, "output size unavailable");
                0
            }
        };
        Ok(ExecutionOutcome {
            provider: if acceleration == Acceleration::Gpu {
                Provider::LocalGpu
            } else {
                Provider::LocalCpu
            },
            output: operation.destination.clone(),
            bytes_written,
            wall_time,
            execution_time: wall_time,
            rate: 0.0,
            billing_mode: BillingMode::Active,
        })
    }

    fn provision(&self, selection: &ProviderSelection, model: &str) -> Option<EndpointSpec> {
        let data_centers = if selection.data_centers.is_empty() {
            vec![self.default_data_center.clone()]
        } else {
            selection.data_centers.clone()
        };
        match provision_spec(
            &self.endpoint_prefix,
            model,
            selection.compute_class.as_deref(),
            data_centers,
            selection.workers_min,
        ) {
            Ok(spec) => Some(spec),
            Err(err) => {
                debug!(model, error = %err, "model cannot be provisioned; existing endpoints only");
                None
            }
        }
    }

    async fn run_inline(
        &self,
        serverless: &Serverless<B, T>,
        operation: &Operation,
        selection: &ProviderSelection,
        started: Instant,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RouteError<B::Error, P::Error>> {
        let input = fs::read(operation.source())
            .await
            .map_err(|err| RouteError::io(operation.source(), &err))?;
        let model = selection.model_for(&operation.transform);
        let spec = self.provision(selection, &model);
        let endpoint = serverless
            .endpoints
            .ensure_endpoint(
                &endpoint_name_for_model(&self.endpoint_prefix, &model),
                spec.as_ref(),
                cancel,
            )
            .await?;

        let payload = inline_payload(operation, &model, &STANDARD.encode(input));
        let job = match ModelKind::of(&model) {
            ModelKind::Image => {
                serverless
                    .jobs
                    .run_sync(&endpoint.id, &payload, progress, cancel)
                    .await?
            }
            ModelKind::Ffmpeg => {
                serverless
                    .jobs
                    .submit_and_poll(&endpoint.id, &payload, progress, cancel)
                    .await?
            }
        };

        let encoded = job
            .output_str("output_base64")
            .or_else(|| job.output_str("image_base64"))
            .ok_or_else(|| RouteError::InvalidOutput {
                job_id: job.id.clone(),
                message: String::from("missing output_base64 / image_base64"),
            })?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| RouteError::InvalidOutput {
                job_id: job.id.clone(),
                message: err.to_string(),
            })?;
        let bytes_written = write_output(operation.destination(), &bytes, cancel).await?;
        Ok(remote_outcome(
            &endpoint,
            operation,
            bytes_written,
            started.elapsed(),
            job.execution_time,
        ))
    }

    async fn run_volume(
        &self,
        serverless: &Serverless<B, T>,
        operation: &Operation,
        selection: &ProviderSelection,
        started: Instant,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RouteError<B::Error, P::Error>> {
        let workflow = serverless.workflow.as_ref().ok_or_else(|| {
            ConfigError::Unsupported(String::from(
                "network volumes need object store credentials (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY)",
            ))
        })?;
        let model = selection.model_for(&operation.transform);
        let job = VolumeJob {
            input: operation.source.clone(),
            output: operation.destination.clone(),
            engine_args: operation.transform.remote_args(),
            output_format: operation.output_extension(),
            scale: upscale_factor(&operation.transform),
            model: model.clone(),
        };
        let settings = WorkflowSettings {
            endpoint_prefix: endpoint_name_for_model(&self.endpoint_prefix, &model),
            provision: self.provision(selection, &model),
            volume: selection.volume.clone(),
            data_center: selection
                .data_centers
                .first()
                .cloned()
                .unwrap_or_else(|| self.default_data_center.clone()),
            volume_name_prefix: format!("{}-vol", self.endpoint_prefix),
            keep_on_failure: selection.keep_on_failure,
        };
        let outcome = workflow.run(&job, &settings, progress, cancel).await?;
        Ok(remote_outcome(
            &outcome.endpoint,
            operation,
            outcome.bytes_downloaded,
            started.elapsed(),
            outcome.job.execution_time,
        ))
    }

    async fn run_prediction(
        upscaler: &PredictionUpscaler<P>,
        operation: &Operation,
        selection: &ProviderSelection,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RouteError<B::Error, P::Error>> {
        let model_path = prediction::model_path(&selection.model_for(&operation.transform))
            .map_err(ConfigError::Unsupported)?;
        let scale = upscale_factor(&operation.transform).unwrap_or(2);
        let outcome = upscaler
            .upscale(
                &model_path,
                operation.source(),
                operation.destination(),
                scale,
                cancel,
            )
            .await?;
        Ok(ExecutionOutcome {
            provider: Provider::RemotePrediction,
            output: operation.destination.clone(),
            bytes_written: outcome.bytes_written,
            wall_time: started.elapsed(),
            execution_time: outcome.predict_time,
            rate: cost::PREDICTION_RATE,
            billing_mode: BillingMode::Flex,
        })
    }
}

/// Applies one transform to each batch file through an [`ExecutionRouter`].
pub struct RoutedTransform<'r, R, B, T, P>
where
    R: MediaRunner,
{
    router: &'r ExecutionRouter<R, B, T, P>,
    transform: Transform,
    selection: ProviderSelection,
}

impl<'r, R, B, T, P> RoutedTransform<'r, R, B, T, P>
where
    R: MediaRunner,
{
    /// Binds `transform` and `selection` to `router`.
    #[must_use]
    pub const fn new(
        router: &'r ExecutionRouter<R, B, T, P>,
        transform: Transform,
        selection: ProviderSelection,
    ) -> Self {
        Self {
            router,
            transform,
            selection,
        }
    }
}

impl<R, B, T, P> FileProcessor for RoutedTransform<'_, R, B, T, P>
where
    R: MediaRunner,
    B: VolumeBackend + Clone,
    T: ObjectTransfer,
    P: PredictionBackend,
{
    type Error = RouteError<B::Error, P::Error>;

    fn process<'a>(
        &'a self,
        job: &'a FileJob,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, ExecutionOutcome, Self::Error> {
        Box::pin(async move {
            if let Some(parent) = job.destination.parent().filter(|dir| !dir.as_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| RouteError::io(parent, &err))?;
            }
            let operation = Operation::new(
                self.transform.clone(),
                job.source.clone(),
                job.destination.clone(),
            );
            let mut progress = |stage: &str, elapsed: Duration| {
                debug!(file = %job.source, stage, elapsed = ?elapsed, "progress");
            };
            self.router
                .execute(&operation, &self.selection, &mut progress, cancel)
                .await
        })
    }
}

const fn upscale_factor(transform: &Transform) -> Option<u32> {
    match transform {
        Transform::Upscale { scale } => Some(*scale),
        _ => None,
    }
}

fn remote_outcome(
    endpoint: &Endpoint,
    operation: &Operation,
    bytes_written: u64,
    wall_time: Duration,
    execution_time: Duration,
) -> ExecutionOutcome {
    ExecutionOutcome {
        provider: Provider::RemoteServerless,
        output: operation.destination.clone(),
        bytes_written,
        wall_time,
        execution_time,
        rate: endpoint.rate(),
        billing_mode: endpoint.billing_mode(),
    }
}

/// Job input for the inline (no volume) path.
#[must_use]
pub fn inline_payload(operation: &Operation, model: &str, encoded_input: &str) -> Value {
    let mut input = Map::new();
    let output_ext = operation.output_extension().unwrap_or_default();
    match ModelKind::of(model) {
        ModelKind::Ffmpeg => {
            input.insert(String::from("input_base64"), Value::from(encoded_input));
            input.insert(
                String::from("ffmpeg_args"),
                Value::from(operation.transform.remote_args()),
            );
            input.insert(String::from("output_ext"), Value::from(output_ext));
        }
        ModelKind::Image => {
            input.insert(String::from("image_base64"), Value::from(encoded_input));
            input.insert(
                String::from("scale"),
                Value::from(upscale_factor(&operation.transform).unwrap_or(2)),
            );
            input.insert(String::from("output_format"), Value::from(output_ext));
        }
    }
    Value::Object(input)
}

async fn write_output<E, P>(
    destination: &Utf8Path,
    bytes: &[u8],
    cancel: &CancellationToken,
) -> Result<u64, RouteError<E, P>>
where
    E: std::error::Error + 'static,
    P: std::error::Error + 'static,
{
    let result = cancellable(
        cancel,
        async {
            if let Some(parent) = destination.parent().filter(|dir| !dir.as_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| RouteError::io(parent, &err))?;
            }
            fs::write(destination, bytes)
                .await
                .map_err(|err| RouteError::io(destination, &err))?;
            Ok(u64::try_from(bytes.len()).unwrap_or(u64::MAX))
        },
        || RouteError::Cancelled,
    )
    .await;
    if result.is_err() {
        discard_partial(destination).await;
    }
    result
}
