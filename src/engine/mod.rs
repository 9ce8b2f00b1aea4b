//! Local media engine adapter.
//!
//! Translates an [`Operation`] into an `ffmpeg` (or upscaler) invocation,
//! choosing hardware-acceleration flags and encoders from the host platform
//! and the selected [`Acceleration`]. The engine runs the command through a
//! [`MediaRunner`] so tests can script outcomes. A failed run removes any
//! partial output before the error is returned.

mod probe;
mod runner;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::media;
use crate::operation::{ChunkSpec, Operation, OperationError, StackAxis, TranscodeOptions, Transform};

pub use probe::{MediaProbe, ProbeStream};
pub use runner::{CommandOutput, MediaRunner, ProcessRunner};

/// Default media engine binary.
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
/// Default probe binary.
pub const DEFAULT_FFPROBE_BIN: &str = "ffprobe";
/// Default super-resolution binary.
pub const DEFAULT_UPSCALER_BIN: &str = "realesrgan-ncnn-vulkan";

/// CPU or GPU execution on the local host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acceleration {
    /// Software decode, filter and encode.
    Cpu,
    /// Hardware decode and encode where the platform supports it.
    Gpu,
}

/// Host platform families with different hardware-acceleration stacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostPlatform {
    /// `VideoToolbox` acceleration.
    MacOs,
    /// CUDA / NVENC acceleration.
    Other,
}

impl HostPlatform {
    /// Platform the binary was compiled for.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Other
        }
    }
}

/// Binaries the engine shells out to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineBinaries {
    /// Media engine.
    pub ffmpeg: String,
    /// Media prober.
    pub ffprobe: String,
    /// Super-resolution upscaler.
    pub upscaler: String,
}

impl Default for EngineBinaries {
    fn default() -> Self {
        Self {
            ffmpeg: DEFAULT_FFMPEG_BIN.to_owned(),
            ffprobe: DEFAULT_FFPROBE_BIN.to_owned(),
            upscaler: DEFAULT_UPSCALER_BIN.to_owned(),
        }
    }
}

/// Errors raised by the local engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Raised when the operation parameters are unusable.
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// Raised when a process cannot be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// OS error message.
        message: String,
    },
    /// Raised when a process exits unsuccessfully.
    #[error("{program} failed ({acceleration:?}) with status {status}: {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Acceleration in effect.
        acceleration: Acceleration,
        /// Exit status text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when probe output cannot be interpreted.
    #[error("failed to probe {path}: {message}")]
    Probe {
        /// File being probed.
        path: Utf8PathBuf,
        /// Description of the problem.
        message: String,
    },
    /// Raised when concat inputs do not share codecs or dimensions.
    #[error("incompatible inputs: {0}")]
    Incompatible(String),
    /// Raised when a filesystem step fails.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// OS error message.
        message: String,
    },
    /// Raised when the run is cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Runs operations on the local host.
#[derive(Clone, Debug)]
pub struct LocalEngine<R: MediaRunner> {
    runner: R,
    binaries: EngineBinaries,
    platform: HostPlatform,
}

impl<R: MediaRunner> LocalEngine<R> {
    /// Creates an engine for the current platform.
    #[must_use]
    pub const fn new(runner: R, binaries: EngineBinaries) -> Self {
        Self {
            runner,
            binaries,
            platform: HostPlatform::current(),
        }
    }

    /// Overrides the platform; used by tests to cover both flag sets.
    #[must_use]
    pub const fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    /// Returns the configured binaries.
    #[must_use]
    pub const fn binaries(&self) -> &EngineBinaries {
        &self.binaries
    }

    /// Executes `operation` and writes its output.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when validation, probing, the subprocess or a
    /// filesystem step fails, or when `cancel` fires.
    pub async fn execute(
        &self,
        operation: &Operation,
        acceleration: Acceleration,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        operation.transform.validate()?;
        prepare_destination(operation).await?;

        match &operation.transform {
            Transform::Upscale { scale } => {
                let args = upscale_args(operation, *scale);
                self.run_checked(&self.binaries.upscaler, &args, acceleration, operation, cancel)
                    .await
            }
            Transform::Concat { rest } => {
                self.execute_concat(operation, rest, acceleration, cancel)
                    .await
            }
            Transform::Chunk(spec) => {
                let segment_seconds = match spec {
                    ChunkSpec::Length(seconds) => *seconds,
                    ChunkSpec::Count(count) => {
                        let duration = self.probe(operation.source(), cancel).await?.duration()?;
                        divide(duration, *count)
                    }
                };
                let args = chunk_args(operation, segment_seconds);
                self.run_checked(&self.binaries.ffmpeg, &args, acceleration, operation, cancel)
                    .await
            }
            _ => {
                let args = self.ffmpeg_args(operation, acceleration);
                self.run_checked(&self.binaries.ffmpeg, &args, acceleration, operation, cancel)
                    .await
            }
        }
    }

    /// Builds the `ffmpeg` argument list for single-invocation transforms.
    #[must_use]
    pub fn ffmpeg_args(&self, operation: &Operation, acceleration: Acceleration) -> Vec<String> {
        let mut args = base_args();
        match &operation.transform {
            Transform::Transcode(options) => {
                args.extend(self.decode_flags(acceleration, false));
                push_input(&mut args, operation.source());
                args.extend(self.transcode_args(options, acceleration));
                push_output(&mut args, operation.destination());
            }
            Transform::Stack { other, axis } => {
                push_input(&mut args, operation.source());
                push_input(&mut args, other);
                let stack = match axis {
                    StackAxis::Horizontal => "hstack",
                    StackAxis::Vertical => "vstack",
                };
                args.extend([
                    String::from("-filter_complex"),
                    format!("[0:v][1:v]{stack}=inputs=2[v]"),
                    String::from("-map"),
                    String::from("[v]"),
                ]);
                push_output(&mut args, operation.destination());
            }
            Transform::Combine { fps } => {
                args.extend([String::from("-framerate"), fps.to_string()]);
                push_input(&mut args, operation.source());
                args.extend([
                    String::from("-c:v"),
                    String::from("libx264"),
                    String::from("-pix_fmt"),
                    String::from("yuv420p"),
                ]);
                push_output(&mut args, operation.destination());
            }
            Transform::ExtractFrames => {
                args.extend(self.decode_flags(acceleration, true));
                push_input(&mut args, operation.source());
                push_output(&mut args, &operation.destination().join("frame_%05d.png"));
            }
            transform => {
                args.extend(self.decode_flags(acceleration, true));
                push_input(&mut args, operation.source());
                if let Some(filter) = transform.filter() {
                    args.push(String::from("-vf"));
                    args.push(self.accelerated_filter(&filter, acceleration));
                }
                args.extend(transform.extra_args());
                if acceleration == Acceleration::Gpu && media::is_video(operation.destination()) {
                    args.extend(self.video_encoder_flags());
                }
                push_output(&mut args, operation.destination());
            }
        }
        args
    }

    fn decode_flags(&self, acceleration: Acceleration, keep_frames_on_device: bool) -> Vec<String> {
        if acceleration == Acceleration::Cpu {
            return Vec::new();
        }
        match self.platform {
            HostPlatform::MacOs => vec![String::from("-hwaccel"), String::from("videotoolbox")],
            HostPlatform::Other if keep_frames_on_device => vec![
                String::from("-hwaccel"),
                String::from("cuda"),
                String::from("-hwaccel_output_format"),
                String::from("cuda"),
            ],
            HostPlatform::Other => vec![String::from("-hwaccel"), String::from("cuda")],
        }
    }

    fn accelerated_filter(&self, filter: &str, acceleration: Acceleration) -> String {
        if acceleration == Acceleration::Gpu && self.platform == HostPlatform::Other {
            filter
                .replace("scale=", "scale_npp=")
                .replace("transpose=", "transpose_npp=")
        } else {
            filter.to_owned()
        }
    }

    fn video_encoder_flags(&self) -> Vec<String> {
        let flags: &[&str] = match self.platform {
            HostPlatform::MacOs => &["-c:v", "h264_videotoolbox", "-b:v", "5M"],
            HostPlatform::Other => &["-c:v", "h264_nvenc", "-preset", "p4", "-tune", "hq"],
        };
        flags.iter().map(|flag| (*flag).to_owned()).collect()
    }

    fn transcode_args(&self, options: &TranscodeOptions, acceleration: Acceleration) -> Vec<String> {
        let mut args = Vec::new();
        let video_codec = options.video_codec.as_deref().map_or("copy", |codec| {
            let (encoder, tuning) = self.resolve_encoder(codec, acceleration);
            args.extend(tuning.iter().map(|flag| (*flag).to_owned()));
            encoder
        });
        args.extend([String::from("-c:v"), video_codec.to_owned()]);
        args.extend([
            String::from("-c:a"),
            options.audio_codec.clone().unwrap_or_else(|| String::from("copy")),
        ]);
        if let Some(bitrate) = &options.video_bitrate {
            args.extend([String::from("-b:v"), bitrate.clone()]);
        }
        if let Some(bitrate) = &options.audio_bitrate {
            args.extend([String::from("-b:a"), bitrate.clone()]);
        }
        if let Some(crf) = options.crf {
            args.extend([String::from("-crf"), crf.to_string()]);
        }
        args
    }

    fn resolve_encoder<'c>(
        &self,
        codec: &'c str,
        acceleration: Acceleration,
    ) -> (&'c str, &'static [&'static str]) {
        const NVENC_TUNING: &[&str] = &["-preset", "p4", "-tune", "hq"];
        match (acceleration, self.platform, codec) {
            (Acceleration::Gpu, HostPlatform::MacOs, "h264") => ("h264_videotoolbox", &[]),
            (Acceleration::Gpu, HostPlatform::MacOs, "hevc") => ("hevc_videotoolbox", &[]),
            (Acceleration::Gpu, HostPlatform::Other, "h264") => ("h264_nvenc", NVENC_TUNING),
            (Acceleration::Gpu, HostPlatform::Other, "hevc") => ("hevc_nvenc", NVENC_TUNING),
            (Acceleration::Gpu, HostPlatform::Other, "av1") => ("av1_nvenc", NVENC_TUNING),
            (Acceleration::Cpu, _, "h264") => ("libx264", &[]),
            (Acceleration::Cpu, _, "hevc") => ("libx265", &[]),
            (Acceleration::Cpu, _, "av1") => ("libsvtav1", &["-preset", "6"]),
            (Acceleration::Cpu, _, "vp9") => ("libvpx-vp9", &[]),
            (_, _, other) => (other, &[]),
        }
    }

    async fn execute_concat(
        &self,
        operation: &Operation,
        rest: &[Utf8PathBuf],
        acceleration: Acceleration,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut inputs = Vec::with_capacity(rest.len() + 1);
        inputs.push(operation.source().to_path_buf());
        inputs.extend(rest.iter().cloned());
        self.check_concat_compatible(&inputs, cancel).await?;

        let list_path = probe::write_concat_list(&inputs).await?;
        let args = concat_args(&list_path, operation.destination());
        let result = self
            .run_checked(&self.binaries.ffmpeg, &args, acceleration, operation, cancel)
            .await;
        if let Err(err) = tokio::fs::remove_file(&list_path).await {
            debug!(path = %list_path, error = %err, "failed to remove concat list");
        }
        result
    }

    async fn run_checked(
        &self,
        program: &str,
        args: &[String],
        acceleration: Acceleration,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        debug!(program, args = ?args, "running local engine");
        let outcome = match self.runner.run(program, args, cancel).await {
            Ok(output) if output.is_success() => return Ok(()),
            Ok(output) => EngineError::Failed {
                program: program.to_owned(),
                acceleration,
                status: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            },
            Err(err) => err,
        };
        remove_partial_output(operation).await;
        Err(outcome)
    }
}

fn base_args() -> Vec<String> {
    vec![
        String::from("-hide_banner"),
        String::from("-loglevel"),
        String::from("error"),
    ]
}

fn push_input(args: &mut Vec<String>, path: &Utf8Path) {
    args.push(String::from("-i"));
    args.push(path.to_string());
}

fn push_output(args: &mut Vec<String>, path: &Utf8Path) {
    args.push(String::from("-y"));
    args.push(path.to_string());
}

fn upscale_args(operation: &Operation, scale: u32) -> Vec<String> {
    let mut args = vec![
        String::from("-i"),
        operation.source().to_string(),
        String::from("-o"),
        operation.destination().to_string(),
        String::from("-s"),
        scale.to_string(),
    ];
    if let Some(ext) = operation.output_extension() {
        args.extend([String::from("-f"), ext]);
    }
    args
}

fn chunk_args(operation: &Operation, segment_seconds: f64) -> Vec<String> {
    vec![
        String::from("-v"),
        String::from("error"),
        String::from("-i"),
        operation.source().to_string(),
        String::from("-c"),
        String::from("copy"),
        String::from("-f"),
        String::from("segment"),
        String::from("-segment_time"),
        format!("{segment_seconds:.6}"),
        String::from("-reset_timestamps"),
        String::from("1"),
        String::from("-y"),
        operation.destination().to_string(),
    ]
}

fn concat_args(list_path: &Utf8Path, destination: &Utf8Path) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        String::from("-f"),
        String::from("concat"),
        String::from("-safe"),
        String::from("0"),
    ]);
    push_input(&mut args, list_path);
    args.extend([String::from("-c"), String::from("copy")]);
    push_output(&mut args, destination);
    args
}

#[expect(
    clippy::float_arithmetic,
    reason = "segment length is a fraction of the probed duration"
)]
fn divide(duration: f64, parts: u32) -> f64 {
    duration / f64::from(parts)
}

/// Removes the destination left behind by a failed run. Frame directories
/// and segment patterns are left alone.
async fn remove_partial_output(operation: &Operation) {
    if matches!(
        operation.transform,
        Transform::ExtractFrames | Transform::Chunk(_)
    ) {
        return;
    }
    let destination = operation.destination();
    match tokio::fs::remove_file(destination).await {
        Ok(()) => warn!(path = %destination, "removed partial output after failure"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %destination, error = %err, "failed to remove partial output"),
    }
}

async fn prepare_destination(operation: &Operation) -> Result<(), EngineError> {
    let dir = if matches!(operation.transform, Transform::ExtractFrames) {
        Some(operation.destination())
    } else {
        operation
            .destination()
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
    };
    let Some(dir) = dir else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| EngineError::Io {
            path: dir.to_path_buf(),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests;
