//! Daemon Server Implementation
//!
//! Owns the [`Hub`] for the lifetime of the process:
//! - Starts every subsystem from the loaded configuration
//! - Polls the signal flags set by the signal task
//! - Rescans modules on request
//! - Shuts the hub down gracefully
//!
//! ```text
//!   signal task ──flags──▶ DaemonServer::run ──▶ Hub
//!                                                 ├── ModuleHost ◀── module socket
//!                                                 ├── RenderEngine
//!                                                 ├── SurfaceHost ◀── satellite TCP
//!                                                 └── Store (periodic flush)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use keyhub_core::{Hub, HubConfig};

/// How often the run loop checks the signal flags
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The main daemon server
pub struct DaemonServer {
    config: HubConfig,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(config: HubConfig) -> Self {
        Self { config }
    }

    /// Run the hub until `shutdown` is set
    pub async fn run(self, shutdown: Arc<AtomicBool>, rescan: Arc<AtomicBool>) -> Result<()> {
        let hub = Hub::start(self.config)
            .await
            .context("Failed to start hub")?;

        info!(
            rpc_socket = ?hub.rpc_socket(),
            satellite = ?hub.satellite_addr(),
            modules = hub.registry().ids().len(),
            "Hub running"
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested");
                break;
            }

            if rescan.swap(false, Ordering::SeqCst) {
                let count = hub.rescan_modules();
                info!(modules = count, "Modules rescanned");
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        hub.shutdown().await.context("Hub shutdown failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyhub_core::SatelliteConfig;

    #[tokio::test]
    async fn test_run_until_shutdown_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HubConfig::default();
        config.rpc.socket_path = dir.path().join("modules.sock");
        config.satellite = SatelliteConfig::for_testing();
        config.modules.user_dir = Some(dir.path().join("modules"));
        config.store.data_dir = Some(dir.path().join("store"));

        let shutdown = Arc::new(AtomicBool::new(false));
        let rescan = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(DaemonServer::new(config).run(Arc::clone(&shutdown), Arc::clone(&rescan)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!rescan.load(Ordering::SeqCst));
        assert!(dir.path().join("modules.sock").exists());

        shutdown.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!dir.path().join("modules.sock").exists());
    }
}
