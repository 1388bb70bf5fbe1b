//! SIGINT/SIGTERM handling.
//!
//! A backup run is raced against [`wait_for_signal`]; when a signal wins, the
//! pipeline future is dropped so the work-directory lock and the staging
//! directory are released by their guards before the process exits.
//! Restores never install these handlers.

use tokio::signal;
use tracing::{info, warn};

/// Name of the signal that ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_signal() -> Signal {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => {
            info!("Received SIGINT, aborting");
            Signal::Interrupt
        }
        _ = terminate => {
            info!("Received SIGTERM, aborting");
            Signal::Terminate
        }
    }
}
