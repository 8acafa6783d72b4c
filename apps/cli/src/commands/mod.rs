//! Command implementations for the Torchline CLI.

pub mod infer;
pub mod snapshots;
pub mod train;

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancels `token` on the first SIGINT.
pub(crate) fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Ok(()) = signal::ctrl_c().await {
            tracing::info!("Interrupt received, aborting trainer");
            token.cancel();
        }
    });
}
