use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Tokens cancelled by process signals.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    /// Cancelled on the first SIGTERM or SIGINT.
    pub graceful: CancellationToken,
    /// Cancelled on the second one.
    pub hard: CancellationToken,
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The first signal asks for a graceful shutdown, letting running
/// invocations finish. A second signal asks for a hard shutdown.
pub fn install_shutdown_handler() -> std::io::Result<ShutdownSignals> {
    let signals = ShutdownSignals::default();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let tokens = signals.clone();
    tokio::spawn(async move {
        for token in [&tokens.graceful, &tokens.hard] {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                }
            }
            token.cancel();
        }
    });

    Ok(signals)
}
