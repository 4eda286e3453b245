//! Print job bookkeeping
//!
//! A `PrintJob` is created when a print starts, updated by the line-number
//! telemetry, and dropped when the job ends or the connection changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header key carrying the slicer's time estimate
const ESTIMATED_TIME_KEY: &str = ";estimated_time(s):";
/// Header key carrying the total line count
const TOTAL_LINES_KEY: &str = ";file_total_lines:";

/// Metadata extracted from a G-code file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GcodeMetadata {
    /// Number of lines in the file
    pub total_lines: u32,
    /// Slicer estimate in seconds
    pub estimated_time_secs: Option<u64>,
}

impl GcodeMetadata {
    /// Extract metadata from G-code text
    ///
    /// A `;file_total_lines:` header wins over counting lines.
    pub fn from_content(content: &str) -> Self {
        let mut total_lines = None;
        let mut estimated_time_secs = None;

        for line in content.lines().take_while(|l| l.starts_with(';') || l.is_empty()) {
            if let Some(value) = line.strip_prefix(ESTIMATED_TIME_KEY) {
                estimated_time_secs = value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .map(|v| v.round() as u64);
            } else if let Some(value) = line.strip_prefix(TOTAL_LINES_KEY) {
                total_lines = value.trim().parse::<u32>().ok();
            }
        }

        Self {
            total_lines: total_lines.unwrap_or_else(|| content.lines().count() as u32),
            estimated_time_secs,
        }
    }
}

/// Progress report re-emitted as `sender:status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintProgress {
    /// File being printed
    pub filename: String,
    /// Last executed line
    pub current_line: u32,
    /// Total lines of the job
    pub total_lines: u32,
    /// Fraction complete in 0.0..=1.0
    pub progress: f64,
    /// Seconds since the job started
    pub elapsed_secs: u64,
    /// Estimated seconds left, if it can be computed
    pub remaining_secs: Option<u64>,
}

/// A running print job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    /// File being printed
    pub filename: String,
    /// Total lines of the job
    pub total_lines: u32,
    /// Slicer estimate in seconds
    pub estimated_time_secs: Option<u64>,
    /// When the start command succeeded
    pub started_at: DateTime<Utc>,
    /// Last executed line reported by the machine
    pub current_line: u32,
    /// Elapsed time reported by the machine, if it reports one
    pub reported_elapsed_secs: Option<u64>,
}

impl PrintJob {
    /// Start tracking a job now
    pub fn new(filename: impl Into<String>, metadata: GcodeMetadata) -> Self {
        Self {
            filename: filename.into(),
            total_lines: metadata.total_lines,
            estimated_time_secs: metadata.estimated_time_secs,
            started_at: Utc::now(),
            current_line: 0,
            reported_elapsed_secs: None,
        }
    }

    /// Fraction complete in 0.0..=1.0
    pub fn progress(&self) -> f64 {
        if self.total_lines == 0 {
            return 0.0;
        }
        (self.current_line as f64 / self.total_lines as f64).clamp(0.0, 1.0)
    }

    /// Time since start, preferring the machine's own counter
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        if let Some(secs) = self.reported_elapsed_secs {
            return Duration::from_secs(secs);
        }
        (now - self.started_at).to_std().unwrap_or_default()
    }

    /// Remaining time from the slicer estimate, or extrapolated from elapsed time
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let progress = self.progress();
        if let Some(estimate) = self.estimated_time_secs {
            let left = estimate as f64 * (1.0 - progress);
            return Some(Duration::from_secs(left.max(0.0).round() as u64));
        }
        if progress <= 0.0 {
            return None;
        }
        let elapsed = self.elapsed(now).as_secs_f64();
        let total = elapsed / progress;
        Some(Duration::from_secs((total - elapsed).max(0.0).round() as u64))
    }

    /// Fold a line-number sample in and compute the resulting progress
    pub fn update_line(&mut self, line: u32, now: DateTime<Utc>) -> PrintProgress {
        self.current_line = line;
        self.snapshot(now)
    }

    /// Fold an elapsed-time sample in
    pub fn update_elapsed(&mut self, secs: u64) {
        self.reported_elapsed_secs = Some(secs);
    }

    /// Current progress without changing anything
    pub fn snapshot(&self, now: DateTime<Utc>) -> PrintProgress {
        PrintProgress {
            filename: self.filename.clone(),
            current_line: self.current_line,
            total_lines: self.total_lines,
            progress: self.progress(),
            elapsed_secs: self.elapsed(now).as_secs(),
            remaining_secs: self.remaining(now).map(|d| d.as_secs()),
        }
    }

    /// True once every line has been executed
    pub fn is_complete(&self) -> bool {
        self.total_lines > 0 && self.current_line >= self.total_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_metadata_from_header() {
        let content = ";header\n;estimated_time(s): 120.4\n;file_total_lines: 500\nG28\nG1 X1\n";
        let meta = GcodeMetadata::from_content(content);
        assert_eq!(meta.total_lines, 500);
        assert_eq!(meta.estimated_time_secs, Some(120));
    }

    #[test]
    fn test_metadata_counts_lines_without_header() {
        let meta = GcodeMetadata::from_content("G28\nG1 X1\nG1 X2\n");
        assert_eq!(meta.total_lines, 3);
        assert_eq!(meta.estimated_time_secs, None);
    }

    #[test]
    fn test_progress_with_estimate() {
        let mut job = PrintJob::new(
            "part.gcode",
            GcodeMetadata {
                total_lines: 200,
                estimated_time_secs: Some(1000),
            },
        );
        let progress = job.update_line(50, job.started_at);
        assert_eq!(progress.progress, 0.25);
        assert_eq!(progress.remaining_secs, Some(750));
        assert!(!job.is_complete());
    }

    #[test]
    fn test_progress_extrapolated_from_elapsed() {
        let mut job = PrintJob::new(
            "part.gcode",
            GcodeMetadata {
                total_lines: 100,
                estimated_time_secs: None,
            },
        );
        let later = job.started_at + ChronoDuration::seconds(60);
        let progress = job.update_line(50, later);
        assert_eq!(progress.elapsed_secs, 60);
        assert_eq!(progress.remaining_secs, Some(60));
    }

    #[test]
    fn test_reported_elapsed_wins() {
        let mut job = PrintJob::new("a.gcode", GcodeMetadata::default());
        job.update_elapsed(42);
        assert_eq!(job.elapsed(Utc::now()).as_secs(), 42);
    }

    #[test]
    fn test_no_remaining_before_first_line() {
        let job = PrintJob::new(
            "a.gcode",
            GcodeMetadata {
                total_lines: 10,
                estimated_time_secs: None,
            },
        );
        assert_eq!(job.remaining(Utc::now()), None);
    }
}
