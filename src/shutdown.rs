use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

/// Graceful shutdown coordinator for imei-relay.
///
/// The flag only flips once; the orchestrator checks it between steps so a
/// request is never left halfway through a portal operation.
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn is_requested(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn request_shutdown(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown requested, finishing the current step");
        }
    }

    /// Install signal handlers for graceful shutdown
    pub fn install_signal_handlers(&self) -> Result<()> {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    if !sender.send_replace(true) {
                        info!("Interrupt received, finishing the current step");
                    }
                }
                Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
            }
        });
        info!("Installed signal handlers for graceful shutdown");
        Ok(())
    }
}
