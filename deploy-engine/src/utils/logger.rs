//! Logging configuration using tracing, and the log sink the deployer talks to.

use crate::utils::errors::DeployError;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level.
///
/// `RUST_LOG` wins over `level` when set. When `log_file` is given every event
/// is also written there, without colors.
pub fn init(level: &str, log_file: Option<&Path>, ansi: bool) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(ansi).with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| DeployError::Config(format!("logging already initialised: {e}")))?;

    Ok(())
}

/// How a message should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Plain,
    /// Skipped entries and other chatter.
    Muted,
    /// Mode banners and "already synchronized".
    Highlight,
    Upload,
    Rename,
    Delete,
    Failure,
}

/// Sink for deployment messages.
///
/// `progress` lines are ephemeral: each one replaces the previous one and
/// they never reach the log file.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str, tone: Tone);

    fn progress(&self, message: &str);
}

/// Logger backed by `tracing` events, with progress drawn on stderr.
#[derive(Debug, Default)]
pub struct TracingLogger {
    show_progress: bool,
    progress_width: AtomicUsize,
}

impl TracingLogger {
    pub fn new(show_progress: bool) -> Self {
        Self {
            show_progress,
            progress_width: AtomicUsize::new(0),
        }
    }

    fn clear_progress(&self) {
        let width = self.progress_width.swap(0, Ordering::Relaxed);
        if width > 0 {
            let mut stderr = std::io::stderr().lock();
            let _ = write!(stderr, "{}\r", " ".repeat(width));
            let _ = stderr.flush();
        }
    }
}

impl Logger for TracingLogger {
    fn log(&self, message: &str, tone: Tone) {
        self.clear_progress();
        match tone {
            Tone::Failure => tracing::error!("{}", message),
            Tone::Muted => tracing::debug!("{}", message),
            _ => tracing::info!("{}", message),
        }
    }

    fn progress(&self, message: &str) {
        if !self.show_progress {
            return;
        }
        let previous = self.progress_width.swap(message.len(), Ordering::Relaxed);
        let padding = previous.saturating_sub(message.len());
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "{}{}\r", message, " ".repeat(padding));
        let _ = stderr.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_tracks_line_width() {
        let logger = TracingLogger::new(true);
        logger.progress("uploading /a.txt [10%]");
        assert_eq!(logger.progress_width.load(Ordering::Relaxed), 22);

        logger.log("done", Tone::Plain);
        assert_eq!(logger.progress_width.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_progress_disabled() {
        let logger = TracingLogger::new(false);
        logger.progress("hidden");
        assert_eq!(logger.progress_width.load(Ordering::Relaxed), 0);
    }
}
