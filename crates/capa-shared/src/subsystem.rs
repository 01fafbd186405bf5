use tokio::sync::{broadcast, oneshot};
use tracing::{error, info};

/// A helper for managing subsystem lifecycle with graceful shutdown.
pub struct SubsystemHandle {
    name: String,
    shutdown_complete_rx: oneshot::Receiver<()>,
}

impl SubsystemHandle {
    pub fn new(name: impl Into<String>) -> (Self, SubsystemShutdownSignal) {
        let (shutdown_complete_tx, shutdown_complete_rx) = oneshot::channel();
        let name = name.into();

        (
            Self {
                name: name.clone(),
                shutdown_complete_rx,
            },
            SubsystemShutdownSignal {
                name,
                shutdown_complete_tx,
            },
        )
    }

    pub async fn wait_for_shutdown(self) {
        match self.shutdown_complete_rx.await {
            Ok(()) => info!("{} subsystem stopped gracefully", self.name),
            Err(_) => error!(
                "{} subsystem stopped without signaling completion",
                self.name
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct SubsystemShutdownSignal {
    name: String,
    shutdown_complete_tx: oneshot::Sender<()>,
}

impl SubsystemShutdownSignal {
    pub fn signal(self) {
        let _ = self.shutdown_complete_tx.send(());
    }

    pub fn signal_with_message(self, message: &str) {
        info!("{}: {}", self.name, message);
        let _ = self.shutdown_complete_tx.send(());
    }
}

/// Spawn a subsystem task that stops on its own (returning a `Result`); used for
/// long-lived loops like the token-refresh scheduler and the session-expiry sweeper.
pub fn spawn_subsystem<F>(
    name: impl Into<String>,
    _system_shutdown_rx: broadcast::Receiver<()>,
    task: F,
) -> SubsystemHandle
where
    F: std::future::Future<Output = Result<(), crate::error::CommonError>> + Send + 'static,
{
    let (handle, signal) = SubsystemHandle::new(name);
    let subsystem_name = handle.name().to_string();

    tokio::spawn(async move {
        match task.await {
            Ok(()) => {
                signal.signal_with_message("stopped gracefully");
            }
            Err(e) => {
                error!("{} stopped with error: {:?}", subsystem_name, e);
                signal.signal();
            }
        }
    });

    handle
}

/// Creates a broadcast shutdown channel and registers `Ctrl+C`/`SIGTERM` as senders.
pub fn install_shutdown_signal_handler() -> broadcast::Sender<()> {
    let (tx, _rx) = broadcast::channel(1);
    let tx_clone = tx.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install ctrl-c handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        info!("shutdown signal received");
        let _ = tx_clone.send(());
    });

    tx
}
