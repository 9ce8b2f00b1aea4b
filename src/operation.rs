//! Media operations and their filter-chain rendering.
//!
//! An [`Operation`] pairs a [`Transform`] with a source and destination. Most
//! transforms render to a single filter expression; the rest contribute raw
//! arguments or need a dedicated invocation (multiple inputs or outputs).
//! Rendering is deterministic, so a [`Transform::Pipeline`] of filters is
//! exactly the comma-joined chain of its members.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Axis used by [`Transform::Flip`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlipAxis {
    /// Mirror left to right.
    Horizontal,
    /// Mirror top to bottom.
    Vertical,
}

impl FromStr for FlipAxis {
    type Err = OperationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "h" | "horizontal" => Ok(Self::Horizontal),
            "v" | "vertical" => Ok(Self::Vertical),
            other => Err(OperationError::InvalidParameter {
                name: "axis",
                message: format!("expected 'h' or 'v', got '{other}'"),
            }),
        }
    }
}

/// Strength presets for [`Transform::Denoise`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DenoisePreset {
    /// Light smoothing.
    Weak,
    /// Moderate smoothing.
    Medium,
    /// Aggressive smoothing.
    Strong,
    /// The filter's built-in defaults.
    #[default]
    Default,
}

impl FromStr for DenoisePreset {
    type Err = OperationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim() {
            "weak" => Self::Weak,
            "med" | "medium" => Self::Medium,
            "strong" => Self::Strong,
            "" | "default" => Self::Default,
            other => {
                return Err(OperationError::InvalidParameter {
                    name: "preset",
                    message: format!("unknown denoise preset '{other}'"),
                });
            }
        })
    }
}

/// Codec and bitrate choices for [`Transform::Transcode`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TranscodeOptions {
    /// Abstract video codec (`h264`, `hevc`, `av1`, `vp9`) or an encoder name.
    pub video_codec: Option<String>,
    /// Audio encoder name passed through unchanged.
    pub audio_codec: Option<String>,
    /// Target video bitrate (for example `5M`).
    pub video_bitrate: Option<String>,
    /// Target audio bitrate (for example `192k`).
    pub audio_bitrate: Option<String>,
    /// Constant rate factor.
    pub crf: Option<u8>,
}

/// How [`Transform::Chunk`] decides segment length.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChunkSpec {
    /// Fixed segment length in seconds.
    Length(f64),
    /// Split into this many equal parts (requires probing the duration).
    Count(u32),
}

/// Stacking direction for [`Transform::Stack`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackAxis {
    /// Side by side.
    Horizontal,
    /// One above the other.
    Vertical,
}

/// A single media transform and its parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum Transform {
    /// Fit within `width` x `height`, preserving aspect ratio.
    Scale {
        /// Maximum width in pixels.
        width: u32,
        /// Maximum height in pixels.
        height: u32,
    },
    /// Cut a `width` x `height` window at (`x`, `y`).
    Crop {
        /// Window width.
        width: u32,
        /// Window height.
        height: u32,
        /// Left offset.
        x: u32,
        /// Top offset.
        y: u32,
    },
    /// Rotate clockwise by `degrees`.
    Rotate {
        /// Rotation angle.
        degrees: i32,
    },
    /// Mirror along an axis.
    Flip(FlipAxis),
    /// Letterbox to an aspect ratio.
    Pad {
        /// Aspect numerator.
        aspect_width: u32,
        /// Aspect denominator.
        aspect_height: u32,
    },
    /// Adjust brightness (-1.0 to 1.0).
    Brighten {
        /// Brightness offset.
        level: f64,
    },
    /// Adjust contrast (-100 to 100).
    Contrast {
        /// Contrast offset in percent.
        level: f64,
    },
    /// Adjust saturation (0.0 to 3.0).
    Saturate {
        /// Saturation multiplier.
        level: f64,
    },
    /// Reduce noise.
    Denoise(DenoisePreset),
    /// Sharpen with an unsharp mask.
    Sharpen {
        /// Luma amount.
        amount: f64,
    },
    /// Keep the span between two timestamps without re-encoding.
    Trim {
        /// Start timestamp.
        start: String,
        /// End timestamp.
        end: String,
    },
    /// Resample to a frame rate.
    Fps {
        /// Frames per second.
        rate: u32,
    },
    /// Drop the audio stream.
    Mute,
    /// Change playback speed of video and audio together.
    Speed {
        /// Speed multiplier.
        multiplier: f64,
    },
    /// Re-encode with different codecs.
    Transcode(TranscodeOptions),
    /// Explode a video into numbered PNG frames inside the destination directory.
    ExtractFrames,
    /// Copy the audio stream out of a video.
    ExtractAudio,
    /// Place a second input next to the source.
    Stack {
        /// The second input.
        other: Utf8PathBuf,
        /// Stacking direction.
        axis: StackAxis,
    },
    /// Build a video from an image sequence pattern.
    Combine {
        /// Output frame rate.
        fps: u32,
    },
    /// Losslessly join the source with further clips.
    Concat {
        /// Clips appended after the source, in order.
        rest: Vec<Utf8PathBuf>,
    },
    /// Split a video into segments named by the destination pattern.
    Chunk(ChunkSpec),
    /// Super-resolution upscale by an integer factor.
    Upscale {
        /// Scale factor (2 to 4).
        scale: u32,
    },
    /// Several filter transforms applied in one pass.
    Pipeline(Vec<Self>),
}

/// Errors raised while validating or rendering an operation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OperationError {
    /// Raised when a numeric or textual parameter is out of range.
    #[error("invalid {name}: {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Description of the problem.
        message: String,
    },
    /// Raised when a pipeline has no members.
    #[error("pipeline contains no operations")]
    EmptyPipeline,
    /// Raised when a pipeline member cannot be expressed as a filter.
    #[error("operation '{0}' cannot be part of a pipeline")]
    NotAFilter(&'static str),
    /// Raised when a textual pipeline names an unknown operation.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

impl Transform {
    /// Stable lower-case name of the transform.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Scale { .. } => "scale",
            Self::Crop { .. } => "crop",
            Self::Rotate { .. } => "rotate",
            Self::Flip(_) => "flip",
            Self::Pad { .. } => "pad",
            Self::Brighten { .. } => "brighten",
            Self::Contrast { .. } => "contrast",
            Self::Saturate { .. } => "saturate",
            Self::Denoise(_) => "denoise",
            Self::Sharpen { .. } => "sharpen",
            Self::Trim { .. } => "trim",
            Self::Fps { .. } => "fps",
            Self::Mute => "mute",
            Self::Speed { .. } => "speed",
            Self::Transcode(_) => "transcode",
            Self::ExtractFrames => "extract-frames",
            Self::ExtractAudio => "extract-audio",
            Self::Stack { .. } => "stack",
            Self::Combine { .. } => "combine",
            Self::Concat { .. } => "concat",
            Self::Chunk(_) => "chunk",
            Self::Upscale { .. } => "upscale",
            Self::Pipeline(_) => "pipeline",
        }
    }

    /// Returns `true` when the transform only runs on the local engine.
    ///
    /// These transforms read several inputs or write several outputs, which
    /// the single-file remote payloads cannot express.
    #[must_use]
    pub const fn is_local_only(&self) -> bool {
        matches!(
            self,
            Self::ExtractFrames
                | Self::Stack { .. }
                | Self::Combine { .. }
                | Self::Concat { .. }
                | Self::Chunk(_)
        )
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError`] when a parameter is unusable or a pipeline
    /// is empty or contains a non-filter transform.
    pub fn validate(&self) -> Result<(), OperationError> {
        match self {
            Self::Scale { width, height } => {
                require_positive("width", *width)?;
                require_positive("height", *height)
            }
            Self::Crop { width, height, .. } => {
                require_positive("width", *width)?;
                require_positive("height", *height)
            }
            Self::Pad {
                aspect_width,
                aspect_height,
            } => {
                require_positive("aspect width", *aspect_width)?;
                require_positive("aspect height", *aspect_height)
            }
            Self::Fps { rate } => require_positive("fps", *rate),
            Self::Combine { fps } => require_positive("fps", *fps),
            Self::Speed { multiplier } if !is_positive(*multiplier) => {
                Err(OperationError::InvalidParameter {
                    name: "speed",
                    message: String::from("multiplier must be greater than zero"),
                })
            }
            Self::Upscale { scale } if !(2..=4).contains(scale) => {
                Err(OperationError::InvalidParameter {
                    name: "scale",
                    message: format!("upscale factor must be between 2 and 4, got {scale}"),
                })
            }
            Self::Concat { rest } if rest.is_empty() => Err(OperationError::InvalidParameter {
                name: "inputs",
                message: String::from("concat requires at least 2 input files"),
            }),
            Self::Chunk(ChunkSpec::Count(0)) => Err(OperationError::InvalidParameter {
                name: "chunks",
                message: String::from("chunk count must be greater than zero"),
            }),
            Self::Chunk(ChunkSpec::Length(seconds)) if !is_positive(*seconds) => {
                Err(OperationError::InvalidParameter {
                    name: "length",
                    message: String::from("chunk length must be greater than zero"),
                })
            }
            Self::Pipeline(members) => {
                if members.is_empty() {
                    return Err(OperationError::EmptyPipeline);
                }
                for member in members {
                    if member.filter().is_none() || matches!(member, Self::Pipeline(_)) {
                        return Err(OperationError::NotAFilter(member.name()));
                    }
                    member.validate()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Renders the video filter expression, if this transform is a filter.
    #[must_use]
    pub fn filter(&self) -> Option<String> {
        let rendered = match self {
            Self::Scale { width, height } => {
                format!("scale={width}:{height}:force_original_aspect_ratio=decrease")
            }
            Self::Crop {
                width,
                height,
                x,
                y,
            } => format!("crop={width}:{height}:{x}:{y}"),
            Self::Rotate { degrees } => rotate_filter(*degrees),
            Self::Flip(FlipAxis::Horizontal) => String::from("hflip"),
            Self::Flip(FlipAxis::Vertical) => String::from("vflip"),
            Self::Pad {
                aspect_width,
                aspect_height,
            } => format!("pad=ih*{aspect_width}/{aspect_height}:ih:(ow-iw)/2:(oh-ih)/2"),
            Self::Brighten { level } => format!("eq=brightness={level:.6}"),
            Self::Contrast { level } => format!("eq=contrast={:.6}", contrast_factor(*level)),
            Self::Saturate { level } => format!("eq=saturation={level:.6}"),
            Self::Denoise(preset) => String::from(denoise_filter(*preset)),
            Self::Sharpen { amount } => format!("unsharp=5:5:{amount:.6}:5:5:0"),
            Self::Fps { rate } => format!("fps=fps={rate}"),
            Self::Pipeline(members) => {
                let filters = members
                    .iter()
                    .map(Self::filter)
                    .collect::<Option<Vec<_>>>()?;
                if filters.is_empty() {
                    return None;
                }
                filters.join(",")
            }
            _ => return None,
        };
        Some(rendered)
    }

    /// Raw arguments placed after the filter for single-input transforms.
    ///
    /// Transforms that need a dedicated invocation (stack, concat, combine,
    /// chunk, transcode, upscale, extract-frames) return an empty list here.
    #[must_use]
    pub fn extra_args(&self) -> Vec<String> {
        match self {
            Self::Trim { start, end } => vec![
                String::from("-ss"),
                start.clone(),
                String::from("-to"),
                end.clone(),
                String::from("-c"),
                String::from("copy"),
            ],
            Self::Mute => vec![String::from("-an")],
            Self::Speed { multiplier } => vec![
                String::from("-filter_complex"),
                format!(
                    "[0:v]setpts={:.6}*PTS[v];[0:a]atempo={multiplier:.6}[a]",
                    reciprocal(*multiplier)
                ),
                String::from("-map"),
                String::from("[v]"),
                String::from("-map"),
                String::from("[a]"),
            ],
            Self::ExtractAudio => vec![
                String::from("-vn"),
                String::from("-acodec"),
                String::from("copy"),
            ],
            _ => Vec::new(),
        }
    }

    /// Renders the remote argument string: filter as `-vf,<filter>` followed
    /// by the extra arguments, all comma separated.
    #[must_use]
    pub fn remote_args(&self) -> String {
        let mut parts = Vec::new();
        if let Some(filter) = self.filter() {
            parts.push(String::from("-vf"));
            parts.push(filter);
        }
        parts.extend(self.extra_args());
        parts.join(",")
    }
}

fn require_positive(name: &'static str, value: u32) -> Result<(), OperationError> {
    if value == 0 {
        return Err(OperationError::InvalidParameter {
            name,
            message: String::from("must be greater than zero"),
        });
    }
    Ok(())
}

fn is_positive(value: f64) -> bool {
    value > 0.0
}

fn rotate_filter(degrees: i32) -> String {
    match degrees {
        90 => String::from("transpose=1"),
        180 => String::from("transpose=1,transpose=1"),
        270 => String::from("transpose=2"),
        other => format!("rotate={other}*PI/180"),
    }
}

const fn denoise_filter(preset: DenoisePreset) -> &'static str {
    match preset {
        DenoisePreset::Weak => "hqdn3d=2:2:3:3",
        DenoisePreset::Medium => "hqdn3d=4:4:6:6",
        DenoisePreset::Strong => "hqdn3d=6:6:9:9",
        DenoisePreset::Default => "hqdn3d",
    }
}

#[expect(
    clippy::float_arithmetic,
    reason = "contrast maps a percentage onto the eq filter's 1.0-based scale"
)]
fn contrast_factor(level: f64) -> f64 {
    1.0 + level / 100.0
}

#[expect(
    clippy::float_arithmetic,
    reason = "presentation timestamps scale inversely with speed"
)]
fn reciprocal(multiplier: f64) -> f64 {
    1.0 / multiplier
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses a textual pipeline such as `scale=1280x720,brighten=0.1`.
///
/// Blank members are ignored. Supported members are the filter transforms:
/// `scale=WxH`, `crop=WxHxXxY`, `rotate=DEG`, `flip=h|v`, `pad=A:B`,
/// `brighten=L`, `contrast=L`, `saturate=L`, `denoise=PRESET`,
/// `sharpen=AMOUNT`, `fps=N`.
///
/// # Errors
///
/// Returns [`OperationError`] for unknown members, malformed values, or a
/// pipeline with no members.
pub fn parse_pipeline(spec: &str) -> Result<Transform, OperationError> {
    let mut members = Vec::new();
    for raw in spec.split(',') {
        let (raw_name, value) = raw.split_once('=').unwrap_or((raw, ""));
        let name = raw_name.trim();
        if name.is_empty() {
            continue;
        }
        members.push(parse_member(name, value.trim())?);
    }
    let pipeline = Transform::Pipeline(members);
    pipeline.validate()?;
    Ok(pipeline)
}

fn parse_member(name: &str, value: &str) -> Result<Transform, OperationError> {
    Ok(match name {
        "scale" => {
            let [width, height] = parse_dimensions::<2>("scale", value)?;
            Transform::Scale { width, height }
        }
        "crop" => {
            let [width, height, x, y] = parse_dimensions::<4>("crop", value)?;
            Transform::Crop {
                width,
                height,
                x,
                y,
            }
        }
        "rotate" => Transform::Rotate {
            degrees: parse_number("rotate", value)?,
        },
        "flip" => Transform::Flip(value.parse()?),
        "pad" => {
            let (width, height) =
                value
                    .split_once(':')
                    .ok_or_else(|| OperationError::InvalidParameter {
                        name: "pad",
                        message: format!("expected A:B, got '{value}'"),
                    })?;
            Transform::Pad {
                aspect_width: parse_number("pad", width)?,
                aspect_height: parse_number("pad", height)?,
            }
        }
        "brighten" => Transform::Brighten {
            level: parse_number("brighten", value)?,
        },
        "contrast" => Transform::Contrast {
            level: parse_number("contrast", value)?,
        },
        "saturate" => Transform::Saturate {
            level: parse_number("saturate", value)?,
        },
        "denoise" => Transform::Denoise(value.parse()?),
        "sharpen" => Transform::Sharpen {
            amount: parse_number("sharpen", value)?,
        },
        "fps" => Transform::Fps {
            rate: parse_number("fps", value)?,
        },
        other => return Err(OperationError::UnknownOperation(other.to_owned())),
    })
}

fn parse_number<T: FromStr>(name: &'static str, value: &str) -> Result<T, OperationError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| OperationError::InvalidParameter {
            name,
            message: format!("'{value}': {err}"),
        })
}

fn parse_dimensions<const N: usize>(
    name: &'static str,
    value: &str,
) -> Result<[u32; N], OperationError> {
    let parts = value
        .split('x')
        .map(|part| parse_number::<u32>(name, part))
        .collect::<Result<Vec<_>, _>>()?;
    <[u32; N]>::try_from(parts).map_err(|rejected| OperationError::InvalidParameter {
        name,
        message: format!("expected {N} 'x'-separated values, got {}", rejected.len()),
    })
}

/// An immutable unit of work: what to do, to which file, and where to write.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    /// Transform to apply.
    pub transform: Transform,
    /// Input path.
    pub source: Utf8PathBuf,
    /// Output path (a directory for [`Transform::ExtractFrames`], a pattern
    /// for [`Transform::Chunk`]).
    pub destination: Utf8PathBuf,
}

impl Operation {
    /// Creates an operation.
    #[must_use]
    pub fn new(
        transform: Transform,
        source: impl Into<Utf8PathBuf>,
        destination: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            transform,
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Source path.
    #[must_use]
    pub fn source(&self) -> &Utf8Path {
        &self.source
    }

    /// Destination path.
    #[must_use]
    pub fn destination(&self) -> &Utf8Path {
        &self.destination
    }

    /// Output extension without the dot, lower-cased.
    #[must_use]
    pub fn output_extension(&self) -> Option<String> {
        crate::media::extension_lowercase(&self.destination)
    }
}
