use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The server drains its workers when the token fires; a worker tears its
/// environment down.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => {
                tracing::info!(signal = name, "Received signal, initiating graceful shutdown");
                trigger.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
        }
    });

    token
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}
