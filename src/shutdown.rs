use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// The scheduler loop stops scanning when it fires: every launched job is
/// killed and then reaped through the normal path, so its after-hooks run and
/// its completion record is written. Jobs still waiting for lock keys are
/// dropped without running. The dashboard stops accepting connections on the
/// same token.
///
/// If the signal handlers cannot be installed the token is never cancelled
/// and the process has to be stopped some other way.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping job queue");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping job queue");
            }
        }

        token_clone.cancel();
    });

    token
}
