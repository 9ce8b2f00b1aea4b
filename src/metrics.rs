//! Batch metrics and their human and JSON renderings.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::router::ExecutionOutcome;

/// Outcome of one file in a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct FileRecord {
    /// File name.
    pub name: String,
    /// Billed time on success, wall time on failure.
    pub duration: Duration,
    /// Estimated cost; zero on failure.
    pub cost: f64,
    /// Whether the file was processed.
    pub success: bool,
    /// Failure message.
    pub error: Option<String>,
}

/// Accumulator owned by the batch loop.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchMetrics {
    /// Files found before skipping.
    pub total_files: usize,
    /// Files skipped because their output exists.
    pub skipped: usize,
    /// Files processed successfully.
    pub succeeded: usize,
    /// Files that failed.
    pub failed: usize,
    /// Wall time of the whole batch.
    pub total_time: Duration,
    /// Sum of billed time over successful files.
    pub processing_time: Duration,
    /// Sum of estimated cost over successful files.
    pub total_cost: f64,
    /// Input bytes of successful files.
    pub input_bytes: u64,
    /// Output bytes of successful files.
    pub output_bytes: u64,
    /// Per-file records in processing order.
    pub files: Vec<FileRecord>,
}

impl BatchMetrics {
    /// Starts an accumulator for `total_files` jobs of which `skipped` are
    /// already done.
    #[must_use]
    pub fn new(total_files: usize, skipped: usize) -> Self {
        Self {
            total_files,
            skipped,
            ..Self::default()
        }
    }

    /// Records a processed file.
    #[expect(
        clippy::float_arithmetic,
        reason = "cost totals accumulate floating point dollar amounts"
    )]
    pub fn record_success(&mut self, name: &str, outcome: &ExecutionOutcome, input_bytes: u64) {
        let billed = outcome
            .billing_mode
            .billable_duration(outcome.wall_time, outcome.execution_time);
        let cost = outcome.cost();
        self.succeeded += 1;
        self.processing_time += billed;
        self.total_cost += cost;
        self.input_bytes = self.input_bytes.saturating_add(input_bytes);
        self.output_bytes = self.output_bytes.saturating_add(outcome.bytes_written);
        self.files.push(FileRecord {
            name: name.to_owned(),
            duration: billed,
            cost,
            success: true,
            error: None,
        });
    }

    /// Records a failed file. Failures add neither cost nor bytes.
    pub fn record_failure(&mut self, name: &str, elapsed: Duration, error: &str) {
        self.failed += 1;
        self.files.push(FileRecord {
            name: name.to_owned(),
            duration: elapsed,
            cost: 0.0,
            success: false,
            error: Some(error.to_owned()),
        });
    }

    /// Stores the batch wall time.
    pub const fn finish(&mut self, total_time: Duration) {
        self.total_time = total_time;
    }

    /// Mean billed time over successful files.
    #[must_use]
    pub fn avg_time_per_file(&self) -> Duration {
        u32::try_from(self.succeeded)
            .ok()
            .and_then(|count| self.processing_time.checked_div(count))
            .unwrap_or_default()
    }

    /// Mean cost over successful files.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        reason = "averaging dollar amounts needs floating point division"
    )]
    pub fn avg_cost_per_file(&self) -> f64 {
        match u32::try_from(self.succeeded) {
            Ok(count) if count > 0 => self.total_cost / f64::from(count),
            _ => 0.0,
        }
    }

    /// Serialisable summary.
    #[must_use]
    pub fn report(&self) -> BatchReport {
        BatchReport {
            total_files: self.total_files,
            skipped: self.skipped,
            succeeded: self.succeeded,
            failed: self.failed,
            total_time: format_duration(self.total_time),
            processing_time: format_duration(self.processing_time),
            avg_time_per_file: format_duration(self.avg_time_per_file()),
            total_cost: self.total_cost,
            avg_cost_per_file: self.avg_cost_per_file(),
            input_bytes: self.input_bytes,
            output_bytes: self.output_bytes,
            files: self
                .files
                .iter()
                .map(|file| FileReport {
                    name: file.name.clone(),
                    duration: format_duration(file.duration),
                    cost: file.cost,
                    success: file.success,
                    error: file.error.clone(),
                })
                .collect(),
        }
    }

    /// Renders the two-column summary table followed by any errors.
    #[must_use]
    pub fn render_table(&self) -> String {
        let rows = [
            ("Total Files", self.total_files.to_string()),
            ("Skipped", self.skipped.to_string()),
            ("Succeeded", self.succeeded.to_string()),
            ("Failed", self.failed.to_string()),
            ("Total Time", format_duration(self.total_time)),
            ("Processing Time", format_duration(self.processing_time)),
            ("Avg Time/File", format_duration(self.avg_time_per_file())),
            ("Total Cost", format!("${:.4}", self.total_cost)),
            ("Avg Cost/File", format!("${:.4}", self.avg_cost_per_file())),
            ("Input Size", format_bytes(self.input_bytes)),
            ("Output Size", format_bytes(self.output_bytes)),
        ];
        let label_width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        let value_width = rows
            .iter()
            .map(|(_, value)| value.len())
            .max()
            .unwrap_or(0)
            .max("Value".len());
        let rule = format!(
            "+-{}-+-{}-+",
            "-".repeat(label_width),
            "-".repeat(value_width)
        );

        let mut out = String::new();
        writeln!(out, "{rule}").ok();
        writeln!(out, "| {:<label_width$} | {:<value_width$} |", "Metric", "Value").ok();
        writeln!(out, "{rule}").ok();
        for (label, value) in &rows {
            writeln!(out, "| {label:<label_width$} | {value:<value_width$} |").ok();
        }
        writeln!(out, "{rule}").ok();

        if self.failed > 0 {
            writeln!(out, "\nErrors:").ok();
            for file in self.files.iter().filter(|file| !file.success) {
                writeln!(
                    out,
                    "  - {}: {}",
                    file.name,
                    file.error.as_deref().unwrap_or("unknown error")
                )
                .ok();
            }
        }
        out
    }
}

/// JSON shape of [`BatchMetrics`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchReport {
    /// Files found before skipping.
    pub total_files: usize,
    /// Files skipped.
    pub skipped: usize,
    /// Files processed.
    pub succeeded: usize,
    /// Files failed.
    pub failed: usize,
    /// Batch wall time.
    pub total_time: String,
    /// Billed time.
    pub processing_time: String,
    /// Mean billed time per successful file.
    pub avg_time_per_file: String,
    /// Total estimated cost in dollars.
    pub total_cost: f64,
    /// Mean cost per successful file.
    pub avg_cost_per_file: f64,
    /// Input bytes of successful files.
    pub input_bytes: u64,
    /// Output bytes of successful files.
    pub output_bytes: u64,
    /// Per-file entries.
    pub files: Vec<FileReport>,
}

/// JSON shape of [`FileRecord`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileReport {
    /// File name.
    pub name: String,
    /// Duration, millisecond precision.
    pub duration: String,
    /// Estimated cost.
    pub cost: f64,
    /// Whether the file succeeded.
    pub success: bool,
    /// Failure message, omitted on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Message shown when every planned file already has an output.
#[must_use]
pub fn all_processed_message(skipped: usize) -> String {
    format!("All {skipped} file(s) already processed. Use --overwrite to reprocess.")
}

/// Formats a duration as seconds with millisecond precision, e.g. `1.234s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    format!("{}.{:03}s", duration.as_secs(), duration.subsec_millis())
}

const BYTE_UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Formats a byte count in base-1024 units with two decimals.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut shift = 10_u32;
    let mut unit = "KiB";
    for candidate in BYTE_UNITS.iter().skip(1) {
        if bytes >> (shift + 10) == 0 {
            break;
        }
        shift += 10;
        unit = candidate;
    }
    let whole = bytes >> shift;
    let remainder = u128::from(bytes - (whole << shift));
    let hundredths = (remainder * 100) >> shift;
    format!("{whole}.{hundredths:02} {unit}")
}
