//! Orchestrates remote jobs whose media is staged on a network volume.
//!
//! The workflow resolves (or creates) a volume, resolves the volume's data
//! centre so transfers hit the right regional endpoint, uploads the input,
//! ensures an endpoint that mounts the volume, runs the job with paths under
//! the worker's mount point, downloads the output and finally cleans up.
//! Every stage is a precondition for the next; the first failure aborts the
//! remaining stages. Cleanup is best-effort and never changes the outcome.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendError, Endpoint, EndpointSpec, Job};
use crate::cancel::cancellable;
use crate::endpoint::{EndpointError, EndpointManager, ModelKind};
use crate::job::{JobClient, JobError, Progress};
use crate::object_store::{
    ObjectStoreError, ObjectTransfer, StoreLocation, discard_partial, key_from_mounted,
    mounted_path,
};
use crate::volume::{VolumeBackend, VolumeRequest};

/// Pause after creating a volume before its object API accepts writes.
const VOLUME_SETTLE: Duration = Duration::from_secs(5);

/// Stages of the volume workflow, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkflowStage {
    /// Pick an explicit, discovered or fresh volume.
    ResolveVolume,
    /// Look up the volume's data centre.
    ResolveRegion,
    /// Push the input to the volume.
    Upload,
    /// Find or create an endpoint mounting the volume.
    ResolveEndpoint,
    /// Run the job.
    Submit,
    /// Pull the output back.
    Download,
    /// Delete the volume created for this run.
    Cleanup,
}

impl WorkflowStage {
    /// Stage name used in logs and progress callbacks.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResolveVolume => "resolve_volume",
            Self::ResolveRegion => "resolve_region",
            Self::Upload => "upload",
            Self::ResolveEndpoint => "resolve_endpoint",
            Self::Submit => "submit",
            Self::Download => "download",
            Self::Cleanup => "cleanup",
        }
    }
}

/// How the workflow should obtain its volume.
///
/// Sources are tried in order: an explicit id, then the volume attached to
/// the target endpoint, then a fresh volume of `size_gb`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRef {
    /// Volume to use as-is.
    pub id: Option<String>,
    /// Size for a fresh volume when none is found.
    pub size_gb: Option<u32>,
    /// Requests the volume workflow even without an id or size.
    pub auto_discover: bool,
}

impl VolumeRef {
    /// Returns `true` when any volume source was requested.
    #[must_use]
    pub const fn is_requested(&self) -> bool {
        self.id.is_some() || self.size_gb.is_some() || self.auto_discover
    }
}

/// Per-run workflow settings.
#[derive(Clone, Debug)]
pub struct WorkflowSettings {
    /// Name prefix used to find the endpoint.
    pub endpoint_prefix: String,
    /// Provisioning spec used when no endpoint matches.
    pub provision: Option<EndpointSpec>,
    /// Volume selection.
    pub volume: VolumeRef,
    /// Data centre for fresh volumes, and the fallback region.
    pub data_center: String,
    /// Prefix for fresh volume names.
    pub volume_name_prefix: String,
    /// Leaves the volume in place when the run fails.
    pub keep_on_failure: bool,
}

/// One file to process through a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeJob {
    /// Local input file.
    pub input: Utf8PathBuf,
    /// Local destination for the output.
    pub output: Utf8PathBuf,
    /// Remote model name.
    pub model: String,
    /// Comma-joined arguments for the media engine worker.
    pub engine_args: String,
    /// Output extension override.
    pub output_format: Option<String>,
    /// Upscale factor for image models.
    pub scale: Option<u32>,
}

impl VolumeJob {
    /// Object key for the uploaded input: its base name.
    #[must_use]
    pub fn input_key(&self) -> Option<&str> {
        self.input.file_name()
    }

    /// Object key the worker is told to write: `out_<stem>.<format>`, or
    /// `out_<name>` without a format override.
    #[must_use]
    pub fn default_output_key(&self) -> Option<String> {
        let name = self.input.file_name()?;
        Some(match (&self.output_format, self.input.file_stem()) {
            (Some(format), Some(stem)) => format!("out_{stem}.{format}"),
            _ => format!("out_{name}"),
        })
    }

    /// Job input referencing paths on the mounted volume.
    #[must_use]
    pub fn payload(&self, input_key: &str, output_key: &str) -> Value {
        let mut input = Map::new();
        let output_path = Value::String(mounted_path(output_key));
        match ModelKind::of(&self.model) {
            ModelKind::Image => {
                input.insert(
                    String::from("image_path"),
                    Value::String(mounted_path(input_key)),
                );
                input.insert(String::from("output_path"), output_path);
                if let Some(format) = &self.output_format {
                    input.insert(String::from("output_format"), Value::String(format.clone()));
                }
                if let Some(scale) = self.scale {
                    input.insert(String::from("scale"), Value::from(scale));
                }
            }
            ModelKind::Ffmpeg => {
                input.insert(
                    String::from("input_path"),
                    Value::String(mounted_path(input_key)),
                );
                input.insert(String::from("output_path"), output_path);
                if !self.engine_args.is_empty() {
                    input.insert(
                        String::from("ffmpeg_args"),
                        Value::String(self.engine_args.clone()),
                    );
                }
            }
        }
        Value::Object(input)
    }
}

/// Result of a successful workflow run.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowOutcome {
    /// Finished job.
    pub job: Job,
    /// Endpoint that ran the job.
    pub endpoint: Endpoint,
    /// Volume used for staging.
    pub volume_id: String,
    /// Bytes uploaded.
    pub bytes_uploaded: u64,
    /// Bytes downloaded.
    pub bytes_downloaded: u64,
}

/// Errors surfaced by the volume workflow.
#[derive(Debug, Error)]
pub enum WorkflowError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the input path has no file name.
    #[error("input {0} has no file name")]
    InvalidInput(String),
    /// Raised when no explicit, attached or requested volume exists.
    #[error(
        "no network volume: pass a volume id, attach one to endpoint prefix '{prefix}', or request a size"
    )]
    NoVolume {
        /// Endpoint prefix that was searched.
        prefix: String,
    },
    /// Raised when a fresh volume request is invalid.
    #[error("invalid volume request: {0}")]
    InvalidVolume(#[source] BackendError),
    /// Raised when the provider rejects volume creation.
    #[error("failed to create volume: {0}")]
    CreateVolume(#[source] E),
    /// Raised when the volume cannot be looked up.
    #[error("failed to resolve region of volume {volume_id}: {source}")]
    ResolveRegion {
        /// Volume being resolved.
        volume_id: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when an upload or download fails.
    #[error(transparent)]
    Transfer(#[from] ObjectStoreError),
    /// Raised when no endpoint can be found or created.
    #[error(transparent)]
    Endpoint(EndpointError<E>),
    /// Raised when the job fails.
    #[error(transparent)]
    Job(JobError<E>),
    /// Raised when the caller cancels.
    #[error("volume workflow cancelled")]
    Cancelled,
}

impl<E: std::error::Error + 'static> From<EndpointError<E>> for WorkflowError<E> {
    fn from(value: EndpointError<E>) -> Self {
        match value {
            EndpointError::Cancelled => Self::Cancelled,
            other => Self::Endpoint(other),
        }
    }
}

impl<E: std::error::Error + 'static> From<JobError<E>> for WorkflowError<E> {
    fn from(value: JobError<E>) -> Self {
        match value {
            JobError::Cancelled => Self::Cancelled,
            other => Self::Job(other),
        }
    }
}

/// Runs the volume workflow against a provider and an object store.
#[derive(Clone, Debug)]
pub struct VolumeWorkflow<B, T> {
    backend: B,
    endpoints: EndpointManager<B>,
    jobs: JobClient<B>,
    transfer: T,
    volume_settle: Duration,
}

impl<B, T> VolumeWorkflow<B, T>
where
    B: VolumeBackend + Clone,
    T: ObjectTransfer,
{
    /// Creates a workflow over `backend` and `transfer`.
    #[must_use]
    pub fn new(backend: B, transfer: T) -> Self {
        Self {
            endpoints: EndpointManager::new(backend.clone()),
            jobs: JobClient::new(backend.clone()),
            backend,
            transfer,
            volume_settle: VOLUME_SETTLE,
        }
    }

    /// Overrides the pause after volume creation.
    ///
    /// This is primarily used by tests to keep scenarios fast.
    #[must_use]
    pub const fn with_volume_settle(mut self, settle: Duration) -> Self {
        self.volume_settle = settle;
        self
    }

    /// Runs every stage for `job`.
    ///
    /// `progress` receives each stage name and the job's phases, with the
    /// time elapsed since the stage (or job) started.
    ///
    /// # Errors
    ///
    /// Returns the [`WorkflowError`] of the first stage that fails.
    pub async fn run(
        &self,
        job: &VolumeJob,
        settings: &WorkflowSettings,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome, WorkflowError<B::Error>> {
        let mut created_volume = None;
        let result = self
            .run_stages(job, settings, &mut created_volume, &mut *progress, cancel)
            .await;
        if result.is_err() {
            discard_partial(&job.output).await;
        }

        let skip_cleanup = result.is_err() && settings.keep_on_failure;
        match created_volume {
            Some(volume_id) if skip_cleanup => {
                info!(volume_id = %volume_id, "keeping volume after failure for inspection");
            }
            Some(volume_id) => {
                progress(WorkflowStage::Cleanup.as_str(), Duration::ZERO);
                self.cleanup(&volume_id).await;
            }
            None => {}
        }
        result
    }

    async fn run_stages(
        &self,
        job: &VolumeJob,
        settings: &WorkflowSettings,
        created_volume: &mut Option<String>,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome, WorkflowError<B::Error>> {
        let input_key = job
            .input_key()
            .ok_or_else(|| WorkflowError::InvalidInput(job.input.to_string()))?;
        let output_key = job
            .default_output_key()
            .ok_or_else(|| WorkflowError::InvalidInput(job.input.to_string()))?;

        let mut stage_started = Instant::now();
        let volume_id = self
            .resolve_volume(settings, created_volume, cancel)
            .await?;
        stage_done(WorkflowStage::ResolveVolume, &mut stage_started, &mut *progress);

        let location = self.resolve_region(&volume_id, settings, cancel).await?;
        stage_done(WorkflowStage::ResolveRegion, &mut stage_started, &mut *progress);

        let bytes_uploaded = cancellable(
            cancel,
            async {
                self.transfer
                    .upload(&location, &job.input, input_key)
                    .await
                    .map_err(WorkflowError::from)
            },
            || WorkflowError::Cancelled,
        )
        .await?;
        stage_done(WorkflowStage::Upload, &mut stage_started, &mut *progress);

        let spec = settings
            .provision
            .as_ref()
            .map(|provision| provision.with_volume(&volume_id));
        let endpoint = self
            .endpoints
            .ensure_endpoint(&settings.endpoint_prefix, spec.as_ref(), cancel)
            .await?;
        if !endpoint.volume_ids.contains(&volume_id) {
            warn!(
                endpoint_id = %endpoint.id,
                volume_id = %volume_id,
                "endpoint does not list the volume; the worker may not see the input"
            );
        }
        stage_done(WorkflowStage::ResolveEndpoint, &mut stage_started, &mut *progress);

        let payload = job.payload(input_key, &output_key);
        let finished = self
            .jobs
            .run_sync(&endpoint.id, &payload, &mut *progress, cancel)
            .await?;
        stage_done(WorkflowStage::Submit, &mut stage_started, &mut *progress);

        let remote_key = finished
            .output_str("output_path")
            .filter(|path| !path.is_empty())
            .map_or(output_key, key_from_mounted);
        let bytes_downloaded = cancellable(
            cancel,
            async {
                self.transfer
                    .download(&location, &remote_key, &job.output)
                    .await
                    .map_err(WorkflowError::from)
            },
            || WorkflowError::Cancelled,
        )
        .await?;
        stage_done(WorkflowStage::Download, &mut stage_started, &mut *progress);

        Ok(WorkflowOutcome {
            job: finished,
            endpoint,
            volume_id,
            bytes_uploaded,
            bytes_downloaded,
        })
    }

    async fn resolve_volume(
        &self,
        settings: &WorkflowSettings,
        created_volume: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> Result<String, WorkflowError<B::Error>> {
        if let Some(id) = &settings.volume.id {
            info!(volume_id = %id, stage = "resolve_volume", "using explicit volume");
            return Ok(id.clone());
        }
        if let Some(id) = self.discover_volume(&settings.endpoint_prefix, cancel).await? {
            info!(volume_id = %id, stage = "resolve_volume", "auto-discovered volume");
            return Ok(id);
        }
        let Some(size_gb) = settings.volume.size_gb else {
            return Err(WorkflowError::NoVolume {
                prefix: settings.endpoint_prefix.clone(),
            });
        };

        let request = VolumeRequest::new(
            format!("{}-{}", settings.volume_name_prefix, unix_seconds()),
            size_gb,
            settings.data_center.as_str(),
        )
        .map_err(WorkflowError::InvalidVolume)?;
        let volume = cancellable(
            cancel,
            async {
                self.backend
                    .create_volume(&request)
                    .await
                    .map_err(WorkflowError::CreateVolume)
            },
            || WorkflowError::Cancelled,
        )
        .await?;
        info!(volume_id = %volume.id, stage = "resolve_volume", "created volume");
        *created_volume = Some(volume.id.clone());

        cancellable(
            cancel,
            async {
                sleep(self.volume_settle).await;
                Ok(())
            },
            || WorkflowError::Cancelled,
        )
        .await?;
        Ok(volume.id)
    }

    async fn discover_volume(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, WorkflowError<B::Error>> {
        match self.endpoints.list_endpoints(prefix, cancel).await {
            Ok(matches) => Ok(matches
                .iter()
                .find_map(|endpoint| endpoint.primary_volume().map(str::to_owned))),
            Err(EndpointError::Cancelled) => Err(WorkflowError::Cancelled),
            Err(err) => {
                warn!(prefix, error = %err, "volume discovery failed; continuing without");
                Ok(None)
            }
        }
    }

    async fn resolve_region(
        &self,
        volume_id: &str,
        settings: &WorkflowSettings,
        cancel: &CancellationToken,
    ) -> Result<StoreLocation, WorkflowError<B::Error>> {
        let volume = cancellable(
            cancel,
            async {
                self.backend.get_volume(volume_id).await.map_err(|source| {
                    WorkflowError::ResolveRegion {
                        volume_id: volume_id.to_owned(),
                        source,
                    }
                })
            },
            || WorkflowError::Cancelled,
        )
        .await?;
        let data_center = if volume.data_center_id.is_empty() {
            warn!(volume_id, fallback = %settings.data_center, "volume reports no data centre");
            settings.data_center.clone()
        } else {
            volume.data_center_id
        };
        info!(volume_id, data_center = %data_center, stage = "resolve_region", "resolved volume region");
        Ok(StoreLocation::new(data_center, volume_id))
    }

    async fn cleanup(&self, volume_id: &str) {
        match self.backend.delete_volume(volume_id).await {
            Ok(()) => info!(volume_id, stage = "cleanup", "deleted volume"),
            Err(err) => warn!(volume_id, error = %err, "volume cleanup failed"),
        }
    }
}

fn stage_done(stage: WorkflowStage, started: &mut Instant, progress: Progress<'_>) {
    let elapsed = started.elapsed();
    info!(stage = stage.as_str(), elapsed = ?elapsed, "stage complete");
    progress(stage.as_str(), elapsed);
    *started = Instant::now();
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(model: &str, format: Option<&str>) -> VolumeJob {
        VolumeJob {
            input: Utf8PathBuf::from("/media/clip.mov"),
            output: Utf8PathBuf::from("/media/clip_out.mp4"),
            model: model.to_owned(),
            engine_args: String::from("-vf,scale=1280:720:force_original_aspect_ratio=decrease"),
            output_format: format.map(str::to_owned),
            scale: None,
        }
    }

    #[test]
    fn default_output_key_applies_format_override() {
        assert_eq!(
            job("ffmpeg", Some("mp4")).default_output_key().as_deref(),
            Some("out_clip.mp4")
        );
        assert_eq!(
            job("ffmpeg", None).default_output_key().as_deref(),
            Some("out_clip.mov")
        );
    }

    #[test]
    fn engine_payload_uses_mount_paths() {
        let payload = job("ffmpeg", Some("mp4")).payload("clip.mov", "out_clip.mp4");
        assert_eq!(
            payload,
            json!({
                "input_path": "/runpod-volume/clip.mov",
                "output_path": "/runpod-volume/out_clip.mp4",
                "ffmpeg_args": "-vf,scale=1280:720:force_original_aspect_ratio=decrease"
            })
        );
    }

    #[test]
    fn image_payload_carries_format_and_scale() {
        let mut image = job("real-esrgan", Some("png"));
        image.scale = Some(4);
        let payload = image.payload("a.jpg", "out_a.png");
        assert_eq!(
            payload,
            json!({
                "image_path": "/runpod-volume/a.jpg",
                "output_path": "/runpod-volume/out_a.png",
                "output_format": "png",
                "scale": 4
            })
        );
    }

    #[test]
    fn volume_ref_reports_request() {
        assert!(!VolumeRef::default().is_requested());
        assert!(
            VolumeRef {
                size_gb: Some(20),
                ..VolumeRef::default()
            }
            .is_requested()
        );
    }
}
