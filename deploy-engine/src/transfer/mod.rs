//! Upload progress reporting.

pub mod progress;

pub use progress::{format_bytes, format_duration, progress_line, TransferStats};
