//! Binary entry point for the mediarelay CLI.

use std::io::{self, BufRead, Write};
use std::process;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use mediarelay::backend::{BackendError, ComputeBackend, Endpoint};
use mediarelay::batch::{BatchEngine, BatchError, BatchOptions, plan};
use mediarelay::config::{AppConfig, ConfigError};
use mediarelay::cost;
use mediarelay::endpoint::{
    DEFAULT_COMPUTE_CLASSES, DEFAULT_IMAGE_MODEL, EndpointError, EndpointManager, FFMPEG_MODEL,
    endpoint_name_for_model, provision_spec,
};
use mediarelay::engine::{LocalEngine, ProcessRunner};
use mediarelay::janitor::{InvalidConfig, Janitor, JanitorConfig, JanitorError, SweepPlan};
use mediarelay::media::MediaKind;
use mediarelay::metrics::{BatchMetrics, all_processed_message, format_bytes, format_duration};
use mediarelay::object_store::{ObjectStoreError, S3Transfer};
use mediarelay::operation::{
    ChunkSpec, DenoisePreset, FlipAxis, Operation, OperationError, StackAxis, TranscodeOptions,
    Transform, parse_pipeline,
};
use mediarelay::prediction::{DEFAULT_MODEL_PATH, PredictionError, ReplicateClient};
use mediarelay::router::{
    ExecutionRouter, Provider, ProviderSelection, RouteError, RoutedTransform, check_supported,
};
use mediarelay::runpod::{RunpodBackend, RunpodError};
use mediarelay::telemetry;
use mediarelay::volume::{VolumeBackend, VolumeRequest};
use mediarelay::workflow::VolumeRef;

mod cli;

use cli::{
    CleanupCommand, Cli, Command, JobArgs, ListCommand, OperationCommand, ProviderArgs,
    ProvisionCommand, StatusCommand, VolumeCommand,
};

type Router = ExecutionRouter<ProcessRunner, RunpodBackend, S3Transfer, ReplicateClient>;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Route(#[from] RouteError<RunpodError, PredictionError>),
    #[error("backend error: {0}")]
    Backend(#[from] RunpodError),
    #[error("invalid request: {0}")]
    Request(#[from] BackendError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError<RunpodError>),
    #[error("prediction API error: {0}")]
    Prediction(#[from] PredictionError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Cleanup(#[from] JanitorError<RunpodError>),
    #[error("invalid cleanup configuration: {0}")]
    CleanupConfig(#[from] InvalidConfig),
    #[error("failed to render report: {0}")]
    Report(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid argument: {0}")]
    Usage(String),
    #[error("cleanup aborted")]
    Aborted,
}

/// A resolved `process` request: either a batch over one transform or a
/// single local-only run with explicit paths.
#[derive(Debug)]
enum Request {
    Batch {
        transform: Transform,
        job: JobArgs,
        kinds: Vec<MediaKind>,
    },
    Direct {
        transform: Transform,
        source: String,
        destination: String,
        provider: ProviderArgs,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let exit_code = match dispatch(cli.command, &cancel).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

async fn dispatch(command: Command, cancel: &CancellationToken) -> Result<(), CliError> {
    if let Command::List(list) = &command {
        return run_list(list);
    }
    let config = AppConfig::load_without_cli_args()?;
    match command {
        Command::Process(process) => run_request(request_for(process.operation)?, &config, cancel).await,
        Command::Pipeline(pipeline) => {
            let transform = parse_pipeline(&pipeline.steps)?;
            run_request(batch(transform, pipeline.job), &config, cancel).await
        }
        Command::Upscale(upscale) => {
            let request = Request::Batch {
                transform: Transform::Upscale {
                    scale: upscale.scale,
                },
                job: upscale.job,
                kinds: vec![MediaKind::Image],
            };
            run_request(request, &config, cancel).await
        }
        Command::Provision(args) => run_provision(&args, &config, cancel).await,
        Command::Status(args) => run_status(&args, &config, cancel).await,
        Command::Cleanup(args) => run_cleanup(&args, &config, cancel).await,
        Command::Volume(volume) => run_volume(volume, &config).await,
        Command::List(list) => run_list(&list),
    }
}

fn batch(transform: Transform, job: JobArgs) -> Request {
    Request::Batch {
        transform,
        job,
        kinds: vec![MediaKind::Image, MediaKind::Video],
    }
}

fn video_batch(transform: Transform, job: JobArgs) -> Request {
    Request::Batch {
        transform,
        job,
        kinds: vec![MediaKind::Video],
    }
}

fn request_for(operation: OperationCommand) -> Result<Request, CliError> {
    Ok(match operation {
        OperationCommand::Scale { width, height, job } => {
            batch(Transform::Scale { width, height }, job)
        }
        OperationCommand::Crop {
            width,
            height,
            x,
            y,
            job,
        } => batch(
            Transform::Crop {
                width,
                height,
                x,
                y,
            },
            job,
        ),
        OperationCommand::Rotate { degrees, job } => batch(Transform::Rotate { degrees }, job),
        OperationCommand::Flip { axis, job } => {
            batch(Transform::Flip(axis.parse::<FlipAxis>()?), job)
        }
        OperationCommand::Pad { aspect, job } => batch(parse_aspect(&aspect)?, job),
        OperationCommand::Brighten { level, job } => batch(Transform::Brighten { level }, job),
        OperationCommand::Contrast { level, job } => batch(Transform::Contrast { level }, job),
        OperationCommand::Saturate { level, job } => batch(Transform::Saturate { level }, job),
        OperationCommand::Denoise { preset, job } => {
            batch(Transform::Denoise(preset.parse::<DenoisePreset>()?), job)
        }
        OperationCommand::Sharpen { amount, job } => batch(Transform::Sharpen { amount }, job),
        OperationCommand::Trim { start, end, job } => {
            video_batch(Transform::Trim { start, end }, job)
        }
        OperationCommand::Fps { rate, job } => video_batch(Transform::Fps { rate }, job),
        OperationCommand::Mute { job } => video_batch(Transform::Mute, job),
        OperationCommand::Speed { multiplier, job } => {
            video_batch(Transform::Speed { multiplier }, job)
        }
        OperationCommand::Transcode {
            video_codec,
            audio_codec,
            video_bitrate,
            audio_bitrate,
            crf,
            job,
        } => video_batch(
            Transform::Transcode(TranscodeOptions {
                video_codec,
                audio_codec,
                video_bitrate,
                audio_bitrate,
                crf,
            }),
            job,
        ),
        OperationCommand::ExtractAudio { mut job } => {
            if job.format.is_none() {
                job.format = Some(String::from("m4a"));
            }
            video_batch(Transform::ExtractAudio, job)
        }
        OperationCommand::ExtractFrames {
            input,
            output,
            provider,
        } => Request::Direct {
            transform: Transform::ExtractFrames,
            source: input,
            destination: output,
            provider,
        },
        OperationCommand::Stack {
            input,
            other,
            vertical,
            output,
            provider,
        } => Request::Direct {
            transform: Transform::Stack {
                other: Utf8PathBuf::from(other),
                axis: if vertical {
                    StackAxis::Vertical
                } else {
                    StackAxis::Horizontal
                },
            },
            source: input,
            destination: output,
            provider,
        },
        OperationCommand::Combine {
            input,
            output,
            fps,
            provider,
        } => Request::Direct {
            transform: Transform::Combine { fps },
            source: input,
            destination: output,
            provider,
        },
        OperationCommand::Concat {
            inputs,
            output,
            provider,
        } => {
            let mut clips = inputs.into_iter();
            let first = clips
                .next()
                .ok_or_else(|| CliError::Usage(String::from("concat needs at least two clips")))?;
            Request::Direct {
                transform: Transform::Concat {
                    rest: clips.map(Utf8PathBuf::from).collect(),
                },
                source: first,
                destination: output,
                provider,
            }
        }
        OperationCommand::Chunk {
            input,
            output,
            length,
            count,
            provider,
        } => {
            let spec = match (length, count) {
                (Some(seconds), _) => ChunkSpec::Length(seconds),
                (None, Some(parts)) => ChunkSpec::Count(parts),
                (None, None) => {
                    return Err(CliError::Usage(String::from(
                        "chunk needs --length or --count",
                    )));
                }
            };
            Request::Direct {
                transform: Transform::Chunk(spec),
                source: input,
                destination: output,
                provider,
            }
        }
    })
}

fn parse_aspect(value: &str) -> Result<Transform, OperationError> {
    let invalid = || OperationError::InvalidParameter {
        name: "aspect",
        message: format!("expected A:B, got '{value}'"),
    };
    let (width, height) = value.split_once(':').ok_or_else(invalid)?;
    Ok(Transform::Pad {
        aspect_width: width.trim().parse().map_err(|_| invalid())?,
        aspect_height: height.trim().parse().map_err(|_| invalid())?,
    })
}

/// Compute class for new endpoints: the flag, else a configured default
/// that differs from the head of the built-in fallback list.
fn compute_class(flag: Option<&str>, config: &AppConfig) -> Option<String> {
    flag.map(str::to_owned).or_else(|| {
        let configured = config.default_gpu.trim();
        (!configured.is_empty() && DEFAULT_COMPUTE_CLASSES.first() != Some(&configured))
            .then(|| configured.to_owned())
    })
}

fn selection(args: &ProviderArgs, config: &AppConfig) -> Result<ProviderSelection, CliError> {
    Ok(ProviderSelection {
        provider: args.provider.parse()?,
        model: args.model.clone(),
        volume: VolumeRef {
            id: args.volume_id.clone(),
            size_gb: args.volume_size,
            auto_discover: args.auto_volume,
        },
        compute_class: compute_class(args.gpu.as_deref(), config),
        data_centers: args.data_centers.clone(),
        workers_min: args.workers_min,
        keep_on_failure: args.keep_failed,
    })
}

fn build_router(config: &AppConfig, selection: &ProviderSelection) -> Result<Router, CliError> {
    config.validate_for(selection.provider)?;
    let engine = LocalEngine::new(ProcessRunner, config.engine_binaries());
    let router = ExecutionRouter::new(
        engine,
        config.endpoint_prefix.clone(),
        config.default_datacenter.clone(),
    );
    Ok(match selection.provider {
        Provider::LocalCpu | Provider::LocalGpu => router,
        Provider::RemoteServerless => {
            let backend = RunpodBackend::from_config(config)?;
            let transfer = if selection.volume.is_requested() {
                Some(S3Transfer::from_env()?)
            } else {
                None
            };
            router.with_serverless(backend, transfer)
        }
        Provider::RemotePrediction => router.with_prediction(ReplicateClient::from_config(config)?),
    })
}

async fn run_request(
    request: Request,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    match request {
        Request::Batch {
            transform,
            job,
            kinds,
        } => run_batch(transform, &job, kinds, config, cancel).await,
        Request::Direct {
            transform,
            source,
            destination,
            provider,
        } => run_direct(transform, source, destination, &provider, config, cancel).await,
    }
}

async fn run_batch(
    transform: Transform,
    job: &JobArgs,
    kinds: Vec<MediaKind>,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let selection = selection(&job.provider, config)?;
    transform.validate()?;
    check_supported(&transform, &selection)?;
    let router = build_router(config, &selection)?;

    let options = BatchOptions {
        recursive: job.recursive,
        overwrite: job.overwrite,
        continue_on_error: job.continue_on_error,
        output_format: job.format.clone(),
        kinds,
    };
    let input = Utf8PathBuf::from(&job.input);
    let planned = plan(&input, job.output.as_deref().map(Utf8Path::new), &options)?;
    if planned.all_processed() {
        writeln!(io::stdout(), "{}", all_processed_message(planned.skipped))?;
        return Ok(());
    }

    let engine = BatchEngine::new(
        RoutedTransform::new(&router, transform, selection),
        job.continue_on_error,
    );
    let metrics = engine.run(&planned, cancel).await;
    write_report(&metrics, job.json)?;
    if cancel.is_cancelled() {
        return Err(CliError::Route(RouteError::Cancelled));
    }
    Ok(metrics.ensure_success()?)
}

fn write_report(metrics: &BatchMetrics, json: bool) -> Result<(), CliError> {
    let mut out = io::stdout().lock();
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&metrics.report())?)?;
    } else {
        write!(out, "{}", metrics.render_table())?;
    }
    Ok(())
}

async fn run_direct(
    transform: Transform,
    source: String,
    destination: String,
    provider: &ProviderArgs,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    let selection = selection(provider, config)?;
    let router = build_router(config, &selection)?;
    let operation = Operation::new(transform, source, destination);
    let mut progress = |stage: &str, elapsed: Duration| {
        tracing::info!(stage, elapsed = ?elapsed, "progress");
    };
    let outcome = router
        .execute(&operation, &selection, &mut progress, cancel)
        .await?;
    writeln!(
        io::stdout(),
        "wrote {} in {} ({}, ${:.4})",
        outcome.output,
        format_duration(outcome.wall_time),
        format_bytes(outcome.bytes_written),
        outcome.cost()
    )?;
    Ok(())
}

async fn run_provision(
    args: &ProvisionCommand,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    config.validate_for(Provider::RemoteServerless)?;
    let manager = EndpointManager::new(RunpodBackend::from_config(config)?);
    let workers_min = if args.active { 1 } else { args.workers_min };
    let data_centers = if args.data_centers.is_empty() {
        vec![config.default_datacenter.clone()]
    } else {
        args.data_centers.clone()
    };
    let mut spec = provision_spec(
        &config.endpoint_prefix,
        &args.model,
        compute_class(args.gpu.as_deref(), config).as_deref(),
        data_centers,
        workers_min,
    )?;
    if let Some(volume_id) = args.volume_id.as_deref() {
        spec = spec.with_volume(volume_id);
    }
    let endpoint = manager
        .ensure_endpoint(
            &endpoint_name_for_model(&config.endpoint_prefix, &args.model),
            Some(&spec),
            cancel,
        )
        .await?;
    writeln!(
        io::stdout(),
        "endpoint {} ready: id={} workers_min={} rate=${:.5}/s",
        endpoint.name,
        endpoint.id,
        endpoint.workers_min,
        endpoint.rate()
    )?;
    Ok(())
}

async fn run_status(
    args: &StatusCommand,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    config.validate_for(Provider::RemoteServerless)?;
    let manager = EndpointManager::new(RunpodBackend::from_config(config)?);
    let endpoints: Vec<Endpoint> = match args.endpoint_id.as_deref() {
        Some(id) => manager.find_by_id(id, cancel).await?.into_iter().collect(),
        None => manager.list_endpoints(&config.endpoint_prefix, cancel).await?,
    };
    let mut out = io::stdout().lock();
    if endpoints.is_empty() {
        writeln!(out, "no endpoints found")?;
        return Ok(());
    }
    for endpoint in endpoints {
        let health = manager.backend().endpoint_health(&endpoint.id).await?;
        writeln!(
            out,
            "{} ({}) workers idle={} running={} | jobs queued={} in_progress={} completed={} failed={} | ${:.5}/s",
            endpoint.name,
            endpoint.id,
            health.workers_idle,
            health.workers_running,
            health.jobs_in_queue,
            health.jobs_in_progress,
            health.jobs_completed,
            health.jobs_failed,
            endpoint.rate()
        )?;
    }
    Ok(())
}

async fn run_cleanup(
    args: &CleanupCommand,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    config.validate_for(Provider::RemoteServerless)?;
    let prefix = args
        .prefix
        .clone()
        .unwrap_or_else(|| config.endpoint_prefix.clone());
    let janitor = Janitor::new(
        JanitorConfig::new(prefix.as_str(), args.volumes)?,
        RunpodBackend::from_config(config)?,
    );
    let sweep = janitor.plan(cancel).await?;
    if sweep.is_empty() {
        writeln!(io::stdout(), "nothing to clean up for prefix '{prefix}'")?;
        return Ok(());
    }
    describe_sweep(&sweep)?;
    if !args.yes && !confirm("Delete these resources? [y/N] ")? {
        return Err(CliError::Aborted);
    }
    let summary = janitor.sweep(&sweep, cancel).await?;
    writeln!(
        io::stdout(),
        "deleted {} endpoint(s) and {} volume(s)",
        summary.deleted_endpoints,
        summary.deleted_volumes
    )?;
    Ok(())
}

fn describe_sweep(sweep: &SweepPlan) -> io::Result<()> {
    let mut out = io::stdout().lock();
    for endpoint in &sweep.endpoints {
        writeln!(out, "endpoint {} ({})", endpoint.name, endpoint.id)?;
    }
    for volume in &sweep.volumes {
        writeln!(out, "volume {} ({})", volume.name, volume.id)?;
    }
    Ok(())
}

fn confirm(prompt: &str) -> io::Result<bool> {
    let mut out = io::stdout().lock();
    write!(out, "{prompt}")?;
    out.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn run_volume(command: VolumeCommand, config: &AppConfig) -> Result<(), CliError> {
    config.validate_for(Provider::RemoteServerless)?;
    let backend = RunpodBackend::from_config(config)?;
    let mut out = io::stdout().lock();
    match command {
        VolumeCommand::Create {
            name,
            size,
            datacenter,
        } => {
            let request = VolumeRequest::new(
                name,
                size,
                datacenter.unwrap_or_else(|| config.default_datacenter.clone()),
            )?;
            let volume = backend.create_volume(&request).await?;
            writeln!(
                out,
                "created volume {} ({}) {} GB in {}",
                volume.name, volume.id, volume.size_gb, volume.data_center_id
            )?;
        }
        VolumeCommand::List => {
            let volumes = backend.list_volumes().await?;
            if volumes.is_empty() {
                writeln!(out, "no volumes found")?;
            }
            for volume in volumes {
                writeln!(
                    out,
                    "{}  {}  {} GB  {}  {}",
                    volume.id,
                    volume.name,
                    volume.size_gb,
                    volume.data_center_id,
                    volume.status.as_deref().unwrap_or("-")
                )?;
            }
        }
        VolumeCommand::Delete { id } => {
            backend.delete_volume(&id).await?;
            writeln!(out, "deleted volume {id}")?;
        }
    }
    Ok(())
}

fn run_list(command: &ListCommand) -> Result<(), CliError> {
    let mut out = io::stdout().lock();
    match command {
        ListCommand::Models => {
            writeln!(out, "{FFMPEG_MODEL:<28} runpod (filters, trim, mute, speed, extract-audio)")?;
            writeln!(out, "{DEFAULT_IMAGE_MODEL:<28} runpod, replicate (upscale)")?;
            writeln!(out, "{DEFAULT_MODEL_PATH:<28} replicate (upscale)")?;
        }
        ListCommand::Providers => {
            for provider in Provider::ALL {
                writeln!(out, "{:<10} {}", provider.as_str(), provider.description())?;
            }
        }
        ListCommand::Gpus => {
            writeln!(out, "{:<36} {:>10} {:>10}", "CLASS", "ACTIVE/S", "FLEX/S")?;
            for (class, rates) in cost::known_classes() {
                writeln!(out, "{class:<36} {:>10.5} {:>10.5}", rates.active, rates.flex)?;
            }
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}
