use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Handle on the process-wide shutdown sequence.
///
/// The monitoring loop and the worker pool watch the token and drain
/// their current unit of work once it is cancelled.
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Token cancelled when shutdown begins; clone it into services.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

/// Install a handler for SIGTERM and SIGINT.
///
/// The first signal starts a graceful shutdown through the returned
/// handle's token. A second signal while draining skips the grace period
/// and exits immediately, so a stuck backend call cannot hold the process
/// hostage.
pub fn install_shutdown_handler() -> ShutdownHandle {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
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

    ShutdownHandle { token }
}
