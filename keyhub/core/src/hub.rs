//! Hub assembly
//!
//! Builds every subsystem from a [`HubConfig`] and owns their background
//! tasks. The daemon binary holds one [`Hub`]; tests build their own.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::HubConfig;
use crate::controls::{ControlRunner, ControlService};
use crate::error::HubResult;
use crate::module::{ModuleHost, ModuleRegistry};
use crate::render::{RenderEngine, SolidRasterizer};
use crate::rpc::{RegistrationGate, RpcServer};
use crate::satellite::SatelliteServer;
use crate::store::Store;
use crate::surface::{SpaceService, SurfaceHost};

/// How long `shutdown` waits for each listener task
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running hub
pub struct Hub {
    config: HubConfig,
    store: Arc<Store>,
    registry: Arc<ModuleRegistry>,
    modules: ModuleHost,
    runner: ControlRunner,
    controls: ControlService,
    spaces: SpaceService,
    render: RenderEngine,
    surfaces: SurfaceHost,
    rpc_socket: PathBuf,
    satellite_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("rpc_socket", &self.rpc_socket)
            .field("satellite_addr", &self.satellite_addr)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Open the store, bind the listeners and start every subsystem
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be loaded or a listener cannot be bound.
    pub async fn start(config: HubConfig) -> HubResult<Self> {
        let store = Arc::new(Store::open(config.store.data_dir.clone())?);

        let registry = Arc::new(ModuleRegistry::new(&config.modules));
        registry.rescan();

        let modules = ModuleHost::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.rpc.clone(),
            config.supervisor.clone(),
            config.queues.restart_concurrency,
        );
        let runner = ControlRunner::new(Arc::clone(&store));
        let render = RenderEngine::new(
            Arc::clone(&store),
            Arc::new(SolidRasterizer),
            config.queues.render_concurrency,
        );
        let surfaces = SurfaceHost::new(Arc::clone(&store), runner.clone());

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        let gate: Arc<dyn RegistrationGate> = Arc::new(modules.clone());
        let rpc = RpcServer::bind(config.rpc.clone(), gate)?;
        let rpc_socket = rpc.socket_path().to_path_buf();
        tasks.push(tokio::spawn(rpc.run(shutdown.subscribe())));

        render.start();
        surfaces.start();

        let satellite_addr = if config.satellite.enabled {
            let server = SatelliteServer::bind(config.satellite.clone(), surfaces.clone()).await?;
            let addr = server.local_addr()?;
            tasks.push(tokio::spawn(server.run(shutdown.subscribe())));
            Some(addr)
        } else {
            info!("Satellite server disabled");
            None
        };

        if store.data_dir().is_some() {
            tasks.push(spawn_flusher(
                Arc::clone(&store),
                config.store.flush_interval,
                shutdown.subscribe(),
            ));
        }

        modules.start();
        info!(rpc_socket = ?rpc_socket, satellite = ?satellite_addr, "Hub started");

        Ok(Self {
            controls: ControlService::new(Arc::clone(&store)),
            spaces: SpaceService::new(Arc::clone(&store)),
            config,
            store,
            registry,
            modules,
            runner,
            render,
            surfaces,
            rpc_socket,
            satellite_addr,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Configuration the hub was started with
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The document store
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Installed modules
    #[must_use]
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Connection processes
    #[must_use]
    pub fn modules(&self) -> &ModuleHost {
        &self.modules
    }

    /// Control input dispatch
    #[must_use]
    pub fn runner(&self) -> &ControlRunner {
        &self.runner
    }

    /// Control editing
    #[must_use]
    pub fn controls(&self) -> &ControlService {
        &self.controls
    }

    /// Space editing
    #[must_use]
    pub fn spaces(&self) -> &SpaceService {
        &self.spaces
    }

    /// Render pipeline
    #[must_use]
    pub fn render(&self) -> &RenderEngine {
        &self.render
    }

    /// Attached surfaces
    #[must_use]
    pub fn surfaces(&self) -> &SurfaceHost {
        &self.surfaces
    }

    /// Bound module socket
    #[must_use]
    pub fn rpc_socket(&self) -> &Path {
        &self.rpc_socket
    }

    /// Bound satellite address, if the server runs
    #[must_use]
    pub fn satellite_addr(&self) -> Option<SocketAddr> {
        self.satellite_addr
    }

    /// Re-read module directories and restart connections to match
    pub fn rescan_modules(&self) -> usize {
        let count = self.registry.rescan();
        self.modules.reconcile();
        count
    }

    /// Stop every connection, close the listeners and flush the store
    ///
    /// # Errors
    ///
    /// Fails if the final flush fails.
    pub async fn shutdown(&self) -> HubResult<()> {
        info!("Hub shutting down");
        self.modules.shutdown().await;
        self.render.shutdown();
        self.surfaces.shutdown();
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Hub task did not stop in time");
                task.abort();
            }
        }

        self.store.flush()?;
        info!("Hub stopped");
        Ok(())
    }
}

fn spawn_flusher(
    store: Arc<Store>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.flush() {
                        warn!(error = %e, "Periodic store flush failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
