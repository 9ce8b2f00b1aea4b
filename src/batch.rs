//! Batch engine: plans file jobs up front, then drives a processor over them
//! one at a time.
//!
//! Planning resolves every destination before any work starts so repeated
//! runs over the same input skip what already exists.

use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendFuture;
use crate::media::{self, AUDIO_EXTENSIONS, IMAGE_EXTENSIONS, MediaKind, VIDEO_EXTENSIONS};
use crate::metrics::BatchMetrics;
use crate::router::ExecutionOutcome;

/// One planned unit of batch work.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileJob {
    /// Input file.
    pub source: Utf8PathBuf,
    /// Resolved output file.
    pub destination: Utf8PathBuf,
    /// Output format (extension without the dot).
    pub format: String,
}

/// Planning and failure policy for one batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchOptions {
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Reprocess files whose output already exists.
    pub overwrite: bool,
    /// Keep going after a file fails.
    pub continue_on_error: bool,
    /// Output format override.
    pub output_format: Option<String>,
    /// Media kinds accepted as inputs.
    pub kinds: Vec<MediaKind>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            overwrite: false,
            continue_on_error: false,
            output_format: None,
            kinds: vec![MediaKind::Image, MediaKind::Video],
        }
    }
}

/// Jobs left to run after the skip policy.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchPlan {
    /// Jobs to process, in enumeration order.
    pub jobs: Vec<FileJob>,
    /// Number of jobs found before skipping.
    pub total: usize,
    /// Number of jobs skipped because their output exists.
    pub skipped: usize,
}

impl BatchPlan {
    /// Returns `true` when jobs were found but all of them were skipped.
    #[must_use]
    pub const fn all_processed(&self) -> bool {
        self.total > 0 && self.jobs.is_empty()
    }
}

/// Errors raised while planning or running a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Raised when the input or an enumerated directory cannot be read.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// OS error message.
        message: String,
    },
    /// Raised when a single input file is not an accepted media kind.
    #[error("input file is not a supported media file: {path}")]
    UnsupportedInput {
        /// Rejected path.
        path: Utf8PathBuf,
    },
    /// Raised when the output format does not suit the input kind.
    #[error("unsupported output format '{format}' for {path}")]
    UnsupportedFormat {
        /// Requested format.
        format: String,
        /// Input it was requested for.
        path: Utf8PathBuf,
    },
    /// Raised when a directory holds no accepted files.
    #[error("no media files found in {path}")]
    Empty {
        /// Directory searched.
        path: Utf8PathBuf,
    },
    /// Raised after a run in which at least one file failed.
    #[error("{failed} of {attempted} file(s) failed")]
    Failed {
        /// Failed files.
        failed: usize,
        /// Files attempted.
        attempted: usize,
    },
}

impl BatchError {
    fn io(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Default output location: `<dir>_out` for directories and
/// `<stem>_out.<ext>` beside a single file.
#[must_use]
pub fn default_output(input: &Utf8Path, is_dir: bool) -> Utf8PathBuf {
    let trimmed = Utf8Path::new(input.as_str().trim_end_matches('/'));
    if is_dir {
        return Utf8PathBuf::from(format!("{trimmed}_out"));
    }
    let stem = trimmed.file_stem().unwrap_or("output");
    let name = trimmed.extension().map_or_else(
        || format!("{stem}_out"),
        |ext| format!("{stem}_out.{ext}"),
    );
    trimmed
        .parent()
        .map_or_else(|| Utf8PathBuf::from(&name), |parent| parent.join(&name))
}

fn normalise_format(format: &str) -> String {
    let lowered = format.trim().trim_start_matches('.').to_ascii_lowercase();
    if lowered == "jpeg" {
        String::from("jpg")
    } else {
        lowered
    }
}

/// Resolves the output format for `source`.
///
/// Images accept `jpg`, `jpeg`, `png` and `webp`. Videos accept any video
/// extension plus audio extensions for audio extraction. Without an
/// override the source extension is kept, with `jpeg` folded into `jpg`.
///
/// # Errors
///
/// Returns [`BatchError::UnsupportedInput`] when `source` is not media and
/// [`BatchError::UnsupportedFormat`] when the override does not suit it.
pub fn resolve_format(source: &Utf8Path, requested: Option<&str>) -> Result<String, BatchError> {
    let kind = MediaKind::of(source).ok_or_else(|| BatchError::UnsupportedInput {
        path: source.to_path_buf(),
    })?;
    let Some(raw) = requested else {
        return media::extension_lowercase(source)
            .map(|ext| normalise_format(&ext))
            .ok_or_else(|| BatchError::UnsupportedInput {
                path: source.to_path_buf(),
            });
    };
    let format = normalise_format(raw);
    let accepted = match kind {
        MediaKind::Image => IMAGE_EXTENSIONS.contains(&format.as_str()),
        MediaKind::Video => {
            VIDEO_EXTENSIONS.contains(&format.as_str()) || AUDIO_EXTENSIONS.contains(&format.as_str())
        }
        MediaKind::Audio => AUDIO_EXTENSIONS.contains(&format.as_str()),
    };
    if accepted {
        Ok(format)
    } else {
        Err(BatchError::UnsupportedFormat {
            format: raw.to_owned(),
            path: source.to_path_buf(),
        })
    }
}

fn accepts(options: &BatchOptions, path: &Utf8Path) -> bool {
    MediaKind::of(path).is_some_and(|kind| options.kinds.contains(&kind))
}

/// Enumerates `input` and resolves every destination.
///
/// A single file maps to `output` (or into it when `output` is an existing
/// directory). A directory maps each accepted file to the same relative
/// path under `output`; files whose format cannot be resolved are skipped.
///
/// # Errors
///
/// Returns [`BatchError`] when `input` cannot be read, a single file is not
/// acceptable, or a directory yields no jobs.
pub fn plan(
    input: &Utf8Path,
    output: Option<&Utf8Path>,
    options: &BatchOptions,
) -> Result<BatchPlan, BatchError> {
    let meta = std::fs::metadata(input).map_err(|err| BatchError::io(input, &err))?;
    let jobs = if meta.is_dir() {
        let root = output.map_or_else(|| default_output(input, true), Utf8Path::to_path_buf);
        let found = plan_directory(input, &root, options)?;
        if found.is_empty() {
            return Err(BatchError::Empty {
                path: input.to_path_buf(),
            });
        }
        found
    } else {
        vec![plan_file(input, output, options)?]
    };

    let total = jobs.len();
    let pending: Vec<FileJob> = if options.overwrite {
        jobs
    } else {
        jobs.into_iter()
            .filter(|job| {
                let exists = job.destination.exists();
                if exists {
                    debug!(destination = %job.destination, "output exists; skipping");
                }
                !exists
            })
            .collect()
    };
    let skipped = total.saturating_sub(pending.len());
    Ok(BatchPlan {
        jobs: pending,
        total,
        skipped,
    })
}

fn plan_file(
    input: &Utf8Path,
    output: Option<&Utf8Path>,
    options: &BatchOptions,
) -> Result<FileJob, BatchError> {
    if !accepts(options, input) {
        return Err(BatchError::UnsupportedInput {
            path: input.to_path_buf(),
        });
    }
    let format = resolve_format(input, options.output_format.as_deref())?;
    let destination = match output {
        Some(dir) if dir.is_dir() => dir
            .join(input.file_name().unwrap_or("output"))
            .with_extension(&format),
        Some(file) if options.output_format.is_none() && file.extension().is_some() => {
            file.to_path_buf()
        }
        Some(file) => file.with_extension(&format),
        None => default_output(input, false).with_extension(&format),
    };
    Ok(FileJob {
        source: input.to_path_buf(),
        destination,
        format,
    })
}

fn plan_directory(
    input: &Utf8Path,
    output: &Utf8Path,
    options: &BatchOptions,
) -> Result<Vec<FileJob>, BatchError> {
    let root = Dir::open_ambient_dir(input, ambient_authority())
        .map_err(|err| BatchError::io(input, &err))?;
    // Outputs written under the input tree must not be picked up as inputs.
    let output_root = output.canonicalize_utf8().ok();
    let mut jobs = Vec::new();
    let mut pending = vec![(root, Utf8PathBuf::new())];
    while let Some((dir, relative)) = pending.pop() {
        let here = input.join(&relative);
        let mut entries = Vec::new();
        for entry in dir.entries().map_err(|err| BatchError::io(&here, &err))? {
            let dir_entry = entry.map_err(|err| BatchError::io(&here, &err))?;
            let name = dir_entry
                .file_name()
                .map_err(|err| BatchError::io(&here, &err))?;
            let is_dir = dir_entry
                .file_type()
                .map_err(|err| BatchError::io(&here.join(&name), &err))?
                .is_dir();
            entries.push((name, is_dir, dir_entry));
        }
        entries.sort_by(|left, right| left.0.cmp(&right.0));

        for (name, is_dir, dir_entry) in entries {
            let child_relative = relative.join(&name);
            if is_dir {
                if options.recursive {
                    let child_path = input.join(&child_relative);
                    if output_root.is_some()
                        && child_path.canonicalize_utf8().ok() == output_root
                    {
                        debug!(path = %child_path, "skipping output directory");
                        continue;
                    }
                    let child = dir_entry
                        .open_dir()
                        .map_err(|err| BatchError::io(&input.join(&child_relative), &err))?;
                    pending.push((child, child_relative));
                }
                continue;
            }
            let source = input.join(&child_relative);
            if !accepts(options, &source) {
                continue;
            }
            match resolve_format(&source, options.output_format.as_deref()) {
                Ok(format) => jobs.push(FileJob {
                    destination: output.join(&child_relative).with_extension(&format),
                    source,
                    format,
                }),
                Err(err) => debug!(path = %source, error = %err, "skipping file"),
            }
        }
    }
    jobs.sort_by(|left, right| left.source.cmp(&right.source));
    Ok(jobs)
}

/// Runs a single planned job.
pub trait FileProcessor: Send + Sync {
    /// Processor specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Produces `job.destination` from `job.source`.
    fn process<'a>(
        &'a self,
        job: &'a FileJob,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, ExecutionOutcome, Self::Error>;
}

/// Drives a [`FileProcessor`] sequentially over a [`BatchPlan`].
#[derive(Clone, Debug)]
pub struct BatchEngine<P> {
    processor: P,
    continue_on_error: bool,
}

impl<P: FileProcessor> BatchEngine<P> {
    /// Creates an engine that aborts on the first failure unless
    /// `continue_on_error` is set.
    #[must_use]
    pub const fn new(processor: P, continue_on_error: bool) -> Self {
        Self {
            processor,
            continue_on_error,
        }
    }

    /// Processes every planned job and returns the collected metrics.
    ///
    /// Cancellation stops the batch before the next file; the file in
    /// flight is recorded as failed.
    pub async fn run(&self, plan: &BatchPlan, cancel: &CancellationToken) -> BatchMetrics {
        let started = Instant::now();
        let mut metrics = BatchMetrics::new(plan.total, plan.skipped);
        for job in &plan.jobs {
            if cancel.is_cancelled() {
                warn!("batch cancelled; remaining files not processed");
                break;
            }
            let name = job.source.file_name().unwrap_or(job.source.as_str());
            let file_started = Instant::now();
            match self.processor.process(job, cancel).await {
                Ok(outcome) => {
                    let input_bytes = std::fs::metadata(&job.source).map_or(0, |meta| meta.len());
                    info!(file = name, cost = outcome.cost(), "file processed");
                    metrics.record_success(name, &outcome, input_bytes);
                }
                Err(err) => {
                    warn!(file = name, error = %err, "file failed");
                    metrics.record_failure(name, file_started.elapsed(), &err.to_string());
                    if !self.continue_on_error {
                        break;
                    }
                }
            }
        }
        metrics.finish(started.elapsed());
        metrics
    }
}

impl BatchMetrics {
    /// Converts any failed file into [`BatchError::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Failed`] when at least one file failed.
    pub const fn ensure_success(&self) -> Result<(), BatchError> {
        if self.failed == 0 {
            Ok(())
        } else {
            Err(BatchError::Failed {
                failed: self.failed,
                attempted: self.succeeded + self.failed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("photos", true, "photos_out")]
    #[case("photos/", true, "photos_out")]
    #[case("dir/photo.png", false, "dir/photo_out.png")]
    #[case("clip", false, "clip_out")]
    fn default_outputs(#[case] input: &str, #[case] is_dir: bool, #[case] expected: &str) {
        assert_eq!(default_output(Utf8Path::new(input), is_dir), Utf8PathBuf::from(expected));
    }

    #[rstest]
    #[case("a.JPEG", None, Ok("jpg"))]
    #[case("a.png", Some("webp"), Ok("webp"))]
    #[case("a.png", Some(".JPEG"), Ok("jpg"))]
    #[case("a.mov", Some("mkv"), Ok("mkv"))]
    #[case("a.mov", Some("m4a"), Ok("m4a"))]
    #[case("a.png", Some("gif"), Err(()))]
    #[case("a.png", Some("mp4"), Err(()))]
    #[case("a.txt", None, Err(()))]
    fn format_resolution(
        #[case] source: &str,
        #[case] requested: Option<&str>,
        #[case] expected: Result<&str, ()>,
    ) {
        let resolved = resolve_format(Utf8Path::new(source), requested).ok();
        assert_eq!(resolved.as_deref(), expected.ok());
    }

    #[test]
    fn all_processed_requires_found_jobs() {
        assert!(!BatchPlan::default().all_processed());
        let plan = BatchPlan {
            jobs: Vec::new(),
            total: 3,
            skipped: 3,
        };
        assert!(plan.all_processed());
    }
}
