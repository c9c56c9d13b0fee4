//! SIGINT/SIGTERM handling.
//!
//! The engine works with blocking I/O and cannot be cancelled midway, so a
//! signal only ends the process. An interrupted deployment leaves its
//! `.running` sentinel on the target.

use tokio::signal;
use tracing::warn;

/// Exit status used after an interrupt (128 + SIGINT).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Wait for SIGINT (Ctrl+C) or SIGTERM and return its name.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waits_without_signal() {
        let waited = tokio::time::timeout(Duration::from_millis(50), wait_for_signal()).await;
        assert!(waited.is_err());
    }
}
