use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel the returned token on SIGINT/SIGTERM so in-flight fetch and index
/// operations wind down promptly.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match unix_signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to install SIGTERM handler: {err}");
                    return;
                }
            };

            tokio::select! {
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("received SIGINT, cancelling run"),
                        Err(err) => {
                            error!("failed to listen for SIGINT: {err}");
                            return;
                        }
                    }
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, cancelling run");
                }
            }
        }

        #[cfg(not(unix))]
        {
            match signal::ctrl_c().await {
                Ok(()) => info!("received SIGINT, cancelling run"),
                Err(err) => {
                    error!("failed to listen for SIGINT: {err}");
                    return;
                }
            }
        }

        trigger.cancel();
    });

    token
}
