use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// Fails if the handlers cannot be installed. The supervisor watches the
/// token between ticks and shuts its workers down once it is cancelled.
pub fn install_shutdown_handler(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    });

    Ok(())
}
