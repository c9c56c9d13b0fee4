//! Progress lines and transfer statistics for a deployment run.

use std::time::{Duration, Instant};

/// Format a `(n of total) label` line, with an optional percentage.
///
/// The counters are padded to the width of `total` so consecutive lines align.
pub fn progress_line(index: usize, total: usize, label: &str, percent: Option<f64>) -> String {
    let width = total.to_string().len();
    let line = format!("({index:>width$} of {total:<width$}) {label}");
    match percent {
        Some(percent) => format!("{line} [{}%]", percent.round() as u64),
        None => line,
    }
}

/// Shortens `path` to at most `max` trailing characters for ephemeral lines.
pub fn shorten(path: &str, max: usize) -> &str {
    match path.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((start, _)) if start > 0 => &path[start..],
        _ => path,
    }
}

/// Running totals for uploaded files.
#[derive(Debug, Clone)]
pub struct TransferStats {
    start_time: Instant,
    files: usize,
    bytes: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            files: 0,
            bytes: 0,
        }
    }

    /// Record one uploaded file of `bytes` bytes.
    pub fn record(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    pub fn files(&self) -> usize {
        self.files
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
