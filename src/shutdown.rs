use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a SIGTERM/SIGINT handler for the process.
///
/// Returns a `CancellationToken` that is cancelled on the first signal; the
/// controller and every worker control loop watch it, and workers drain
/// their device sessions before exiting. A second signal skips the drain
/// and exits immediately, for the case where a hung device keeps a session
/// task from closing.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, draining device sessions");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, draining device sessions");
            }
        }
        token_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting without draining");
        std::process::exit(130);
    });

    token
}
