//! Command-line interface definitions for the `mediarelay` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. It
//! depends on nothing but clap; the binary maps these plain values onto
//! library types.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `mediarelay` binary.
#[derive(Debug, Parser)]
#[command(
    name = "mediarelay",
    about = "Transform images and videos locally or on remote GPU providers",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log progress at info level (overridden by `MEDIARELAY_LOG`).
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,
    /// Command to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Apply one operation to a file or directory.
    #[command(name = "process")]
    Process(ProcessCommand),
    /// Apply a comma-separated chain of filters in one pass.
    #[command(name = "pipeline")]
    Pipeline(PipelineCommand),
    /// Super-resolution upscale of images.
    #[command(name = "upscale")]
    Upscale(UpscaleCommand),
    /// Create (or reuse) a serverless endpoint for a model.
    #[command(name = "provision")]
    Provision(ProvisionCommand),
    /// Show endpoints and their worker counters.
    #[command(name = "status")]
    Status(StatusCommand),
    /// Delete endpoints (and optionally volumes) created by this tool.
    #[command(name = "cleanup")]
    Cleanup(CleanupCommand),
    /// Manage network volumes.
    #[command(name = "volume", subcommand)]
    Volume(VolumeCommand),
    /// List models, providers or compute classes.
    #[command(name = "list", subcommand)]
    List(ListCommand),
}

/// Input, output and batch policy shared by processing commands.
#[derive(Clone, Debug, Args)]
pub(crate) struct JobArgs {
    /// Input file or directory.
    pub(crate) input: String,
    /// Output file or directory (defaults to `<stem>_out.<ext>` or `<dir>_out`).
    #[arg(long, short, value_name = "PATH")]
    pub(crate) output: Option<String>,
    /// Output format override (for example `png`, `webp`, `mp4`).
    #[arg(long, value_name = "EXT")]
    pub(crate) format: Option<String>,
    /// Descend into subdirectories.
    #[arg(long, short)]
    pub(crate) recursive: bool,
    /// Reprocess files whose output already exists.
    #[arg(long)]
    pub(crate) overwrite: bool,
    /// Keep going after a file fails.
    #[arg(long)]
    pub(crate) continue_on_error: bool,
    /// Print the batch report as JSON.
    #[arg(long)]
    pub(crate) json: bool,
    /// Provider selection.
    #[command(flatten)]
    pub(crate) provider: ProviderArgs,
}

/// Provider choice and its scoped settings.
#[derive(Clone, Debug, Args)]
pub(crate) struct ProviderArgs {
    /// Execution provider: local, local-gpu, runpod or replicate.
    #[arg(long, short = 'p', default_value = "local")]
    pub(crate) provider: String,
    /// Remote model (`ffmpeg`, `real-esrgan`, or an `owner/name` path).
    #[arg(long)]
    pub(crate) model: Option<String>,
    /// Existing network volume to stage files on.
    #[arg(long, value_name = "ID", conflicts_with_all = ["volume_size", "auto_volume"])]
    pub(crate) volume_id: Option<String>,
    /// Create a fresh network volume of this size (GB) for the run.
    #[arg(long, value_name = "GB")]
    pub(crate) volume_size: Option<u32>,
    /// Reuse the volume attached to the model's endpoint.
    #[arg(long)]
    pub(crate) auto_volume: bool,
    /// Preferred compute class for new endpoints.
    #[arg(long, value_name = "CLASS")]
    pub(crate) gpu: Option<String>,
    /// Preferred data centre; repeat for fallbacks.
    #[arg(long = "datacenter", value_name = "ID")]
    pub(crate) data_centers: Vec<String>,
    /// Warm workers for newly created endpoints (0 scales to zero).
    #[arg(long, default_value_t = 0)]
    pub(crate) workers_min: u32,
    /// Leave a freshly created volume in place when the run fails.
    #[arg(long)]
    pub(crate) keep_failed: bool,
}

/// Arguments for `mediarelay process`.
#[derive(Debug, Args)]
pub(crate) struct ProcessCommand {
    /// Operation to apply.
    #[command(subcommand)]
    pub(crate) operation: OperationCommand,
}

/// Operations accepted by `mediarelay process`.
#[derive(Debug, Subcommand)]
pub(crate) enum OperationCommand {
    /// Fit within a bounding box, preserving aspect ratio.
    Scale {
        /// Maximum width.
        #[arg(long)]
        width: u32,
        /// Maximum height.
        #[arg(long)]
        height: u32,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Cut a rectangular window.
    Crop {
        /// Window width.
        #[arg(long)]
        width: u32,
        /// Window height.
        #[arg(long)]
        height: u32,
        /// Left offset.
        #[arg(long, default_value_t = 0)]
        x: u32,
        /// Top offset.
        #[arg(long, default_value_t = 0)]
        y: u32,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Rotate clockwise.
    Rotate {
        /// Angle in degrees.
        #[arg(long, allow_negative_numbers = true)]
        degrees: i32,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Mirror horizontally (`h`) or vertically (`v`).
    Flip {
        /// Axis.
        #[arg(long, default_value = "h")]
        axis: String,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Letterbox to an aspect ratio such as `16:9`.
    Pad {
        /// Aspect ratio `A:B`.
        #[arg(long)]
        aspect: String,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Adjust brightness (-1.0 to 1.0).
    Brighten {
        /// Brightness offset.
        #[arg(long, allow_negative_numbers = true)]
        level: f64,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Adjust contrast (-100 to 100).
    Contrast {
        /// Contrast offset.
        #[arg(long, allow_negative_numbers = true)]
        level: f64,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Adjust saturation (0.0 to 3.0).
    Saturate {
        /// Saturation multiplier.
        #[arg(long)]
        level: f64,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Reduce noise (`weak`, `med`, `strong` or `default`).
    Denoise {
        /// Preset.
        #[arg(long, default_value = "default")]
        preset: String,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Sharpen with an unsharp mask.
    Sharpen {
        /// Luma amount.
        #[arg(long, default_value_t = 1.0)]
        amount: f64,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Keep the span between two timestamps.
    Trim {
        /// Start timestamp.
        #[arg(long)]
        start: String,
        /// End timestamp.
        #[arg(long)]
        end: String,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Resample to a frame rate.
    Fps {
        /// Frames per second.
        #[arg(long)]
        rate: u32,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Drop the audio stream.
    Mute {
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Change playback speed.
    Speed {
        /// Speed multiplier (0.25 to 4.0).
        #[arg(long)]
        multiplier: f64,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Re-encode with different codecs (local providers only).
    Transcode {
        /// Video codec (`h264`, `hevc`, `av1`, `vp9`) or encoder name.
        #[arg(long)]
        video_codec: Option<String>,
        /// Audio encoder.
        #[arg(long)]
        audio_codec: Option<String>,
        /// Video bitrate (for example `5M`).
        #[arg(long)]
        video_bitrate: Option<String>,
        /// Audio bitrate (for example `192k`).
        #[arg(long)]
        audio_bitrate: Option<String>,
        /// Constant rate factor.
        #[arg(long)]
        crf: Option<u8>,
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Explode a video into numbered PNG frames (local providers only).
    ExtractFrames {
        /// Input video.
        input: String,
        /// Directory receiving the frames.
        #[arg(long, short)]
        output: String,
        /// Provider selection.
        #[command(flatten)]
        provider: ProviderArgs,
    },
    /// Copy the audio stream out of a video.
    ExtractAudio {
        /// Shared job arguments.
        #[command(flatten)]
        job: JobArgs,
    },
    /// Place two videos side by side or stacked (local providers only).
    Stack {
        /// First input.
        input: String,
        /// Second input.
        other: String,
        /// Stack vertically instead of horizontally.
        #[arg(long)]
        vertical: bool,
        /// Output file.
        #[arg(long, short)]
        output: String,
        /// Provider selection.
        #[command(flatten)]
        provider: ProviderArgs,
    },
    /// Build a video from an image sequence pattern (local providers only).
    Combine {
        /// Input pattern such as `frames/frame_%05d.png`.
        input: String,
        /// Output video.
        #[arg(long, short)]
        output: String,
        /// Frame rate.
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Provider selection.
        #[command(flatten)]
        provider: ProviderArgs,
    },
    /// Join clips losslessly (local providers only).
    Concat {
        /// Clips in playback order.
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<String>,
        /// Output file.
        #[arg(long, short)]
        output: String,
        /// Provider selection.
        #[command(flatten)]
        provider: ProviderArgs,
    },
    /// Split a video into segments (local providers only).
    Chunk {
        /// Input video.
        input: String,
        /// Output pattern such as `part_%03d.mp4`.
        #[arg(long, short)]
        output: String,
        /// Segment length in seconds.
        #[arg(long, conflicts_with = "count", required_unless_present = "count")]
        length: Option<f64>,
        /// Number of equal segments.
        #[arg(long)]
        count: Option<u32>,
        /// Provider selection.
        #[command(flatten)]
        provider: ProviderArgs,
    },
}

/// Arguments for `mediarelay pipeline`.
#[derive(Debug, Args)]
pub(crate) struct PipelineCommand {
    /// Filter chain such as `scale=1280x720,brighten=0.1`.
    #[arg(long, short = 's')]
    pub(crate) steps: String,
    /// Shared job arguments.
    #[command(flatten)]
    pub(crate) job: JobArgs,
}

/// Arguments for `mediarelay upscale`.
#[derive(Debug, Args)]
pub(crate) struct UpscaleCommand {
    /// Scale factor (2 to 4).
    #[arg(long, default_value_t = 2)]
    pub(crate) scale: u32,
    /// Shared job arguments.
    #[command(flatten)]
    pub(crate) job: JobArgs,
}

/// Arguments for `mediarelay provision`.
#[derive(Debug, Args)]
pub(crate) struct ProvisionCommand {
    /// Model the endpoint serves.
    #[arg(long, default_value = "ffmpeg")]
    pub(crate) model: String,
    /// Compute class.
    #[arg(long, value_name = "CLASS")]
    pub(crate) gpu: Option<String>,
    /// Data centre; repeat for fallbacks.
    #[arg(long = "datacenter", value_name = "ID")]
    pub(crate) data_centers: Vec<String>,
    /// Warm workers (0 scales to zero).
    #[arg(long, default_value_t = 0, conflicts_with = "active")]
    pub(crate) workers_min: u32,
    /// Keep one worker warm (active billing).
    #[arg(long)]
    pub(crate) active: bool,
    /// Network volume to attach.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: Option<String>,
}

/// Arguments for `mediarelay status`.
#[derive(Debug, Args)]
pub(crate) struct StatusCommand {
    /// Only show this endpoint.
    #[arg(long, value_name = "ID")]
    pub(crate) endpoint_id: Option<String>,
}

/// Arguments for `mediarelay cleanup`.
#[derive(Debug, Args)]
pub(crate) struct CleanupCommand {
    /// Name prefix to sweep (defaults to the configured endpoint prefix).
    #[arg(long)]
    pub(crate) prefix: Option<String>,
    /// Also delete matching network volumes.
    #[arg(long)]
    pub(crate) volumes: bool,
    /// Skip the confirmation prompt.
    #[arg(long, short)]
    pub(crate) yes: bool,
}

/// `mediarelay volume` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum VolumeCommand {
    /// Create a network volume.
    Create {
        /// Volume name.
        #[arg(long)]
        name: String,
        /// Size in GB (minimum 10).
        #[arg(long, default_value_t = 10)]
        size: u32,
        /// Data centre (defaults to the configured one).
        #[arg(long)]
        datacenter: Option<String>,
    },
    /// List network volumes.
    List,
    /// Delete a network volume.
    Delete {
        /// Volume id.
        id: String,
    },
}

/// `mediarelay list` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum ListCommand {
    /// Remote models and where they run.
    Models,
    /// Execution providers.
    Providers,
    /// Compute classes and their per-second rates.
    Gpus,
}
