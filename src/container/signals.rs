//! Shutdown signal wiring.
//!
//! Shutdown is cooperative: a termination signal only cancels the
//! container's shutdown token, and the run loop honors that at the end of
//! its current iteration, after send and commit. The signal set is exactly
//! what the container's lifecycle needs — SIGTERM for the workload
//! manager's stop request and SIGINT for an operator's ctrl-c.

use tokio_util::sync::CancellationToken;

/// Spawn a watcher that cancels `token` on the first termination signal.
///
/// If no handler can be installed the token is left untouched and the
/// coordinator-driven shutdown path remains the only one.
pub(crate) fn cancel_on_termination(token: CancellationToken) {
    tokio::spawn(async move {
        match termination().await {
            Ok(signal) => {
                tracing::info!(signal, "termination signal received");
                token.cancel();
            }
            Err(error) => {
                tracing::warn!(error = %error, "signal handler unavailable");
            }
        }
    });
}

#[cfg(unix)]
async fn termination() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn termination() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}
