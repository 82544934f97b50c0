//! Module Host
//!
//! Reconciles the stored connections against running module processes.
//!
//! ```text
//!   connections watch ──insert/update──▶ restart ─┐
//!                     ──delete─────────▶ stop ────┼──▶ KeyedQueue (per connection, N overall)
//!   reconcile() ─────────────────────▶ restart ───┘
//!
//!   absent ─▶ Starting ─register─▶ Running ─socket lost─▶ Restarting ─register─▶ Running
//!                 │                   │                        │
//!                 └───────────────────┴──────── stop ──────────┴──▶ Stopping ─▶ absent
//! ```
//!
//! Every registration (first launch or after a crash) is followed by `init`
//! and then by a consumer that drains the connection's [`WorkTask`]s.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::registry::{ModuleInfo, ModuleRegistry};
use crate::error::{HubError, HubResult};
use crate::model::{action_definition_id, ActionDefinition, Connection, WorkPayload, WorkTask};
use crate::queue::KeyedQueue;
use crate::rpc::protocol::join_call;
use crate::rpc::{
    ActionDeclaration, Admission, AuthToken, CallHandler, ConnectionStatus, ExecuteAction,
    FeedbackUpdate, HostCall, LogLevel, ModuleCall, Register, RegistrationGate, Rejection,
    RpcChannel, RpcConfig, StatusLevel, ENV_CONNECTION_ID, ENV_SOCKET, ENV_TOKEN,
};
use crate::store::{Change, Store, WatchEvent};
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorEvent};

/// Capacity of the host event stream
const EVENT_CAPACITY: usize = 256;

/// Where a connection is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Process launched, waiting for its first registration
    Starting,
    /// Registered and initialised
    Running,
    /// Socket lost, waiting for the restarted process to register
    Restarting,
    /// Being torn down
    Stopping,
}

/// Notable lifecycle moments, for observers and tests
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    /// A module process registered and `init` was sent
    Registered {
        /// Connection id
        connection_id: String,
    },
    /// The registered socket went away
    Disconnected {
        /// Connection id
        connection_id: String,
    },
    /// The connection's process was stopped and its bookkeeping removed
    Stopped {
        /// Connection id
        connection_id: String,
    },
}

struct ConnectionState {
    phase: ConnectionPhase,
    token: AuthToken,
    supervisor: Arc<Supervisor>,
    generation: u64,
    reserved: bool,
    channel: Option<RpcChannel>,
    events_task: JoinHandle<()>,
}

impl ConnectionState {
    fn has_live_channel(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }
}

struct HostInner {
    store: Arc<Store>,
    registry: Arc<ModuleRegistry>,
    rpc: RpcConfig,
    supervisor: SupervisorConfig,
    transitions: KeyedQueue,
    connections: DashMap<String, ConnectionState>,
    statuses: DashMap<String, ConnectionStatus>,
    events: broadcast::Sender<HostEvent>,
    shutdown: watch::Sender<bool>,
}

/// Runs one supervised module process per enabled connection
#[derive(Clone)]
pub struct ModuleHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("connections", &self.inner.connections.len())
            .finish_non_exhaustive()
    }
}

impl ModuleHost {
    /// Create a host; call [`start`](Self::start) to begin reconciling
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ModuleRegistry>,
        rpc: RpcConfig,
        supervisor: SupervisorConfig,
        restart_concurrency: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HostInner {
                store,
                registry,
                rpc,
                supervisor,
                transitions: KeyedQueue::new("connection-transitions", restart_concurrency),
                connections: DashMap::new(),
                statuses: DashMap::new(),
                events,
                shutdown,
            }),
        }
    }

    /// Watch the connection collection and reconcile what is already stored
    pub fn start(&self) {
        let host = self.clone();
        let mut watcher = self.inner.store.connections.watch();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        event = watcher.next() => match event {
                            Some(WatchEvent::Change(Change::Deleted { id })) => host.queue_stop(&id),
                            Some(WatchEvent::Change(change)) => host.queue_restart(change.id()),
                            Some(WatchEvent::Resync) => host.resync(),
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Connection watch stopped");
            }
            .instrument(tracing::info_span!("module_host")),
        );
        self.reconcile();
    }

    /// Queue a restart for every enabled connection
    pub fn reconcile(&self) {
        let enabled = self.inner.store.connections.find(|c| c.enabled);
        info!(count = enabled.len(), "Reconciling connections");
        for connection in enabled {
            self.queue_restart(&connection.id);
        }
    }

    /// Full rebuild after a lagged change stream
    fn resync(&self) {
        let running: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in running {
            if !self.inner.store.connections.contains(&id) {
                self.queue_stop(&id);
            }
        }
        self.reconcile();
    }

    /// Queue stop-then-start for a connection
    pub fn queue_restart(&self, connection_id: &str) {
        let host = self.clone();
        let id = connection_id.to_string();
        self.inner
            .transitions
            .submit(connection_id, async move { host.restart(&id).await });
    }

    /// Queue a stop for a connection
    pub fn queue_stop(&self, connection_id: &str) {
        let host = self.clone();
        let id = connection_id.to_string();
        self.inner
            .transitions
            .submit(connection_id, async move { host.stop_connection(&id).await });
    }

    /// Restart a connection now, on its transition chain, and wait for it
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the transition was dropped.
    pub async fn restart_now(&self, connection_id: &str) -> HubResult<()> {
        let host = self.clone();
        let id = connection_id.to_string();
        self.inner
            .transitions
            .run(connection_id, async move { host.restart(&id).await })
            .await
    }

    /// Wait until no connection transition is queued or running
    pub async fn wait_idle(&self) {
        self.inner.transitions.wait_idle().await;
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Current phase; `None` when the connection has no process
    #[must_use]
    pub fn connection_phase(&self, connection_id: &str) -> Option<ConnectionPhase> {
        self.inner
            .connections
            .get(connection_id)
            .map(|state| state.phase)
    }

    /// Last status reported by the module (or set by the host on failure)
    #[must_use]
    pub fn connection_status(&self, connection_id: &str) -> Option<ConnectionStatus> {
        self.inner
            .statuses
            .get(connection_id)
            .map(|status| status.clone())
    }

    /// Pid of the connection's current process
    #[must_use]
    pub fn connection_pid(&self, connection_id: &str) -> Option<u32> {
        self.inner
            .connections
            .get(connection_id)
            .and_then(|state| state.supervisor.pid())
    }

    /// Ids of connections with a process, sorted
    #[must_use]
    pub fn active_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Push the stored configuration to a running module
    ///
    /// # Errors
    ///
    /// `NotFound` if the connection is unknown or not registered, otherwise
    /// the RPC failure.
    pub async fn update_config(&self, connection_id: &str) -> HubResult<()> {
        let connection = self.inner.store.connections.require(connection_id)?;
        let channel = self
            .live_channel(connection_id)
            .ok_or_else(|| HubError::not_found("registered module", connection_id))?;
        channel
            .call_typed(&HostCall::UpdateConfig {
                config: connection.config,
            })
            .await?;
        Ok(())
    }

    /// Stop every connection and end the connection watch
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let ids = self.active_connections();
        let stops = ids.iter().map(|id| self.stop_connection(id));
        futures::future::join_all(stops).await;
        info!(count = ids.len(), "Module host stopped");
    }

    fn live_channel(&self, connection_id: &str) -> Option<RpcChannel> {
        self.inner
            .connections
            .get(connection_id)
            .and_then(|state| state.channel.clone())
            .filter(|channel| !channel.is_closed())
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.inner.events.send(event);
    }

    fn set_status(&self, connection_id: &str, status: StatusLevel, message: impl Into<String>) {
        self.inner.statuses.insert(
            connection_id.to_string(),
            ConnectionStatus {
                status,
                message: Some(message.into()),
            },
        );
    }

    // =========================================================================
    // Transitions (always run on the connection's chain)
    // =========================================================================

    async fn restart(&self, connection_id: &str) {
        self.stop_connection(connection_id).await;

        let Some(connection) = self.inner.store.connections.get(connection_id) else {
            return;
        };
        if !connection.enabled {
            debug!(connection_id, "Connection disabled, not starting");
            return;
        }
        let Some(module) = self.inner.registry.get(&connection.module_id) else {
            warn!(connection_id, module = %connection.module_id, "Module not installed");
            self.set_status(connection_id, StatusLevel::Error, "module not installed");
            return;
        };
        self.start_connection(&connection, &module);
    }

    fn start_connection(&self, connection: &Connection, module: &ModuleInfo) {
        let token = AuthToken::generate();
        let spec = module
            .launch_spec()
            .env(ENV_CONNECTION_ID, connection.id.clone())
            .env(
                ENV_SOCKET,
                self.inner.rpc.socket_path.to_string_lossy().into_owned(),
            )
            .env(ENV_TOKEN, token.to_hex());

        let supervisor = Arc::new(Supervisor::new(
            format!("module:{}", connection.id),
            spec,
            self.inner.supervisor.clone(),
        ));
        let events = supervisor.subscribe();
        let events_task = tokio::spawn(
            self.clone()
                .follow_process(connection.id.clone(), events)
                .instrument(tracing::info_span!("connection", id = %connection.id)),
        );

        self.inner.connections.insert(
            connection.id.clone(),
            ConnectionState {
                phase: ConnectionPhase::Starting,
                token,
                supervisor: Arc::clone(&supervisor),
                generation: 0,
                reserved: false,
                channel: None,
                events_task,
            },
        );
        supervisor.start();
        info!(
            connection_id = %connection.id,
            module = %module.manifest.id,
            version = %module.manifest.version,
            "Connection starting"
        );
    }

    async fn stop_connection(&self, connection_id: &str) {
        let (supervisor, channel) = {
            let Some(mut state) = self.inner.connections.get_mut(connection_id) else {
                return;
            };
            state.phase = ConnectionPhase::Stopping;
            (Arc::clone(&state.supervisor), state.channel.take())
        };

        if let Some(channel) = channel {
            channel.close();
        }
        supervisor.stop().await;

        if let Some((_, state)) = self.inner.connections.remove(connection_id) {
            state.events_task.abort();
        }
        info!(connection_id, "Connection stopped");
        self.emit(HostEvent::Stopped {
            connection_id: connection_id.to_string(),
        });
    }

    /// Track process incarnations and enforce the registration deadline
    async fn follow_process(
        self,
        connection_id: String,
        mut events: broadcast::Receiver<SupervisorEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    trace!(missed, "Process events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                SupervisorEvent::Started { generation, .. } => {
                    if let Some(mut state) = self.inner.connections.get_mut(&connection_id) {
                        state.generation = generation;
                    }
                    self.spawn_registration_watchdog(&connection_id, generation);
                }
                SupervisorEvent::Crashed { generation, reason } => {
                    warn!(generation, %reason, "Module process crashed");
                }
                SupervisorEvent::Exited { generation } => {
                    info!(generation, "Module process exited");
                }
                SupervisorEvent::Output { .. } => {}
                SupervisorEvent::Stopped => break,
            }
        }
    }

    fn spawn_registration_watchdog(&self, connection_id: &str, generation: u64) {
        let host = self.clone();
        let id = connection_id.to_string();
        let deadline = self.inner.rpc.registration_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let Some(state) = host.inner.connections.get(&id) else {
                return;
            };
            if state.generation == generation
                && state.phase != ConnectionPhase::Stopping
                && !state.has_live_channel()
            {
                warn!(
                    connection_id = %id,
                    generation,
                    deadline_ms = deadline.as_millis() as u64,
                    "Module did not register in time"
                );
                state
                    .supervisor
                    .kill_current(generation, "registration deadline expired");
            }
        });
    }

    // =========================================================================
    // After registration
    // =========================================================================

    async fn on_registered(self, connection_id: String, channel: RpcChannel) {
        let config = self
            .inner
            .store
            .connections
            .get(&connection_id)
            .map_or(Value::Null, |c| c.config);

        match channel.call_typed(&HostCall::Init { config }).await {
            Ok(_) => {
                info!("Module initialised");
                self.emit(HostEvent::Registered {
                    connection_id: connection_id.clone(),
                });
                let store = Arc::clone(&self.inner.store);
                tokio::spawn(
                    consume_work(store, connection_id.clone(), channel.clone())
                        .instrument(tracing::info_span!("work", connection = %connection_id)),
                );
            }
            Err(e) => {
                warn!(error = %e, "Module init failed");
                self.set_status(&connection_id, StatusLevel::Error, format!("init failed: {e}"));
            }
        }

        channel.closed().await;

        let mut lost = false;
        if let Some(mut state) = self.inner.connections.get_mut(&connection_id) {
            let same = state
                .channel
                .as_ref()
                .is_some_and(|current| current.id() == channel.id());
            if same {
                state.channel = None;
                state.reserved = false;
                if state.phase == ConnectionPhase::Running {
                    state.phase = ConnectionPhase::Restarting;
                }
                lost = true;
            }
        }
        if lost {
            info!("Module socket closed");
            self.emit(HostEvent::Disconnected { connection_id });
        }
    }
}

impl RegistrationGate for ModuleHost {
    fn admit(&self, request: &Register) -> Result<Admission, Rejection> {
        let id = &request.connection_id;
        let Some(mut state) = self.inner.connections.get_mut(id) else {
            return Err(Rejection::UnexpectedConnection(id.clone()));
        };
        if state.phase == ConnectionPhase::Stopping {
            return Err(Rejection::UnexpectedConnection(id.clone()));
        }
        if state.reserved || state.has_live_channel() {
            return Err(Rejection::AlreadyRegistered(id.clone()));
        }
        if !state.token.validate(&request.token) {
            return Err(Rejection::BadToken(id.clone()));
        }
        state.reserved = true;

        Ok(Admission {
            handler: Arc::new(ModuleCalls {
                host: Arc::downgrade(&self.inner),
                connection_id: id.clone(),
            }),
        })
    }

    fn registered(&self, connection_id: &str, channel: RpcChannel) {
        {
            let Some(mut state) = self.inner.connections.get_mut(connection_id) else {
                channel.close();
                return;
            };
            state.channel = Some(channel.clone());
            state.phase = ConnectionPhase::Running;
        }
        tokio::spawn(
            self.clone()
                .on_registered(connection_id.to_string(), channel)
                .instrument(tracing::info_span!("connection", id = %connection_id)),
        );
    }
}

// =============================================================================
// Module → host calls
// =============================================================================

struct ModuleCalls {
    host: Weak<HostInner>,
    connection_id: String,
}

#[async_trait]
impl CallHandler for ModuleCalls {
    async fn handle_call(&self, method: String, payload: Value) -> Result<Value, String> {
        let call: ModuleCall =
            join_call(&method, payload).map_err(|e| format!("unsupported call {method}: {e}"))?;
        let host = self.host.upgrade().ok_or("host is shutting down")?;
        let id = &self.connection_id;

        match call {
            ModuleCall::Register(_) => return Err("already registered".to_string()),
            ModuleCall::LogMessage { level, message } => match level {
                LogLevel::Error => error!(connection_id = %id, "{message}"),
                LogLevel::Warn => warn!(connection_id = %id, "{message}"),
                LogLevel::Info => info!(connection_id = %id, "{message}"),
                LogLevel::Debug => debug!(connection_id = %id, "{message}"),
                LogLevel::Trace => trace!(connection_id = %id, "{message}"),
            },
            ModuleCall::SetStatus(status) => {
                debug!(connection_id = %id, status = ?status.status, "Module status");
                host.statuses.insert(id.clone(), status);
            }
            ModuleCall::SetActionDefinitions { actions } => {
                let count = actions.len();
                replace_action_definitions(&host.store, id, actions)
                    .map_err(|e| e.to_string())?;
                debug!(connection_id = %id, count, "Action definitions replaced");
            }
        }
        Ok(Value::Null)
    }
}

/// Replace a connection's action catalogue in one write
///
/// Rows keep deterministic ids, so an identical declaration writes nothing.
///
/// # Errors
///
/// Propagates transaction failure.
pub fn replace_action_definitions(
    store: &Store,
    connection_id: &str,
    actions: Vec<ActionDeclaration>,
) -> HubResult<()> {
    store.transaction(|tx| {
        let existing = tx.find(&store.action_definitions, |def| {
            def.connection_id == connection_id
        });
        let mut keep = std::collections::HashSet::new();
        for action in actions {
            let row = ActionDefinition {
                id: action_definition_id(connection_id, &action.id),
                connection_id: connection_id.to_string(),
                action_id: action.id,
                name: action.name,
                options: action.options,
            };
            keep.insert(row.id.clone());
            if tx.get(&store.action_definitions, &row.id).as_ref() != Some(&row) {
                tx.upsert(&store.action_definitions, row);
            }
        }
        for stale in existing.iter().filter(|def| !keep.contains(&def.id)) {
            tx.delete(&store.action_definitions, &stale.id);
        }
        Ok(())
    })
}

// =============================================================================
// Work consumer
// =============================================================================

fn pending_work(store: &Store, connection_id: &str) -> Vec<WorkTask> {
    let mut tasks = store
        .work_tasks
        .find(|task| task.connection_id == connection_id);
    tasks.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
    tasks
}

/// Deliver a connection's work tasks until its channel closes
async fn consume_work(store: Arc<Store>, connection_id: String, channel: RpcChannel) {
    let mut watcher = store.work_tasks.watch();
    let mut backlog = pending_work(&store, &connection_id);

    loop {
        for task in std::mem::take(&mut backlog) {
            if channel.is_closed() {
                return;
            }
            deliver(&store, &channel, task).await;
        }

        tokio::select! {
            () = channel.closed() => return,
            event = watcher.next() => match event {
                Some(WatchEvent::Change(Change::Inserted(task) | Change::Replaced(task)))
                    if task.connection_id == connection_id => backlog.push(task),
                Some(WatchEvent::Resync) => backlog = pending_work(&store, &connection_id),
                Some(_) => {}
                None => return,
            },
        }
    }
}

/// Claim a task by deleting it, then make the matching call
async fn deliver(store: &Store, channel: &RpcChannel, task: WorkTask) {
    if !store.work_tasks.delete(&task.id) {
        return;
    }

    let (call, delay) = match task.payload {
        WorkPayload::ExecuteAction {
            control_id,
            action_id,
            options,
            delay_ms,
            ..
        } => (
            HostCall::ExecuteAction(ExecuteAction {
                control_id,
                action_id,
                options,
            }),
            delay_ms,
        ),
        WorkPayload::FeedbackUpdate {
            feedback_id,
            control_id,
            feedback_type,
            options,
        } => (
            HostCall::UpdateFeedback(FeedbackUpdate {
                feedback_id,
                control_id,
                feedback_type,
                options,
            }),
            0,
        ),
        WorkPayload::FeedbackRemove { feedback_id } => {
            (HostCall::RemoveFeedback { feedback_id }, 0)
        }
    };

    if delay == 0 {
        send_work(channel, task.id, call).await;
    } else {
        let channel = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            send_work(&channel, task.id, call).await;
        });
    }
}

async fn send_work(channel: &RpcChannel, task_id: String, call: HostCall) {
    if let Err(e) = channel.call_typed(&call).await {
        warn!(task = %task_id, error = %e, "Work task delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModulesConfig;
    use crate::rpc::{FrameDecoder, API_VERSION};
    use crate::supervisor::ProcessSpec;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Module side of a channel; records every host call
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().clone()
        }

        fn len(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl CallHandler for Recorder {
        async fn handle_call(&self, method: String, payload: Value) -> Result<Value, String> {
            self.calls.lock().push((method, payload));
            Ok(Value::Null)
        }
    }

    /// Host channel wired to an in-memory module
    fn module_link() -> (RpcChannel, RpcChannel, Arc<Recorder>) {
        let (host_end, module_end) = tokio::io::duplex(64 * 1024);
        let recorder = Arc::new(Recorder::default());
        let host = RpcChannel::spawn(
            host_end,
            FrameDecoder::new(),
            Arc::new(Recorder::default()),
            "module",
            Duration::from_secs(5),
        );
        let module = RpcChannel::spawn(
            module_end,
            FrameDecoder::new(),
            Arc::clone(&recorder) as Arc<dyn CallHandler>,
            "host",
            Duration::from_secs(5),
        );
        (host, module, recorder)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn remove_feedback(id: &str) -> WorkPayload {
        WorkPayload::FeedbackRemove {
            feedback_id: id.to_string(),
        }
    }

    /// Book a launched connection the way `start_connection` does
    fn expect_connection(host: &ModuleHost, id: &str, spec: ProcessSpec) -> (String, Arc<Supervisor>) {
        let token = AuthToken::generate();
        let hex = token.to_hex();
        let supervisor = Arc::new(Supervisor::new(id, spec, SupervisorConfig::for_testing()));
        let events_task = tokio::spawn(
            host.clone()
                .follow_process(id.to_string(), supervisor.subscribe()),
        );
        host.inner.connections.insert(
            id.to_string(),
            ConnectionState {
                phase: ConnectionPhase::Starting,
                token,
                supervisor: Arc::clone(&supervisor),
                generation: 0,
                reserved: false,
                channel: None,
                events_task,
            },
        );
        (hex, supervisor)
    }

    fn register(token: &str) -> Register {
        Register {
            api_version: API_VERSION.to_string(),
            connection_id: "conn1".to_string(),
            token: token.to_string(),
        }
    }

    fn host_with(store: Arc<Store>) -> ModuleHost {
        ModuleHost::new(
            store,
            Arc::new(ModuleRegistry::new(&ModulesConfig::default())),
            RpcConfig::default()
                .with_socket_path("/nonexistent/modules.sock")
                .with_registration_timeout(Duration::from_millis(200)),
            SupervisorConfig::for_testing(),
            4,
        )
    }

    fn declare(id: &str, name: &str) -> ActionDeclaration {
        ActionDeclaration {
            id: id.to_string(),
            name: name.to_string(),
            options: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_action_definitions_replaced_atomically() {
        let store = Store::in_memory();
        replace_action_definitions(
            &store,
            "conn1",
            vec![declare("a", "Alpha"), declare("b", "Beta")],
        )
        .unwrap();
        replace_action_definitions(&store, "other", vec![declare("a", "Other")]).unwrap();
        assert_eq!(store.action_definitions.len(), 3);

        replace_action_definitions(&store, "conn1", vec![declare("b", "Beta 2")]).unwrap();

        let rows = store.action_definitions.find(|d| d.connection_id == "conn1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action_id, "b");
        assert_eq!(rows[0].name, "Beta 2");
        assert_eq!(rows[0].id, action_definition_id("conn1", "b"));
        // Another connection's rows are untouched
        assert_eq!(store.action_definitions.find(|d| d.connection_id == "other").len(), 1);
    }

    #[tokio::test]
    async fn test_identical_declaration_writes_nothing() {
        let store = Store::in_memory();
        replace_action_definitions(&store, "conn1", vec![declare("a", "Alpha")]).unwrap();

        let mut watcher = store.action_definitions.watch();
        replace_action_definitions(&store, "conn1", vec![declare("a", "Alpha")]).unwrap();
        store.action_definitions.upsert(ActionDefinition {
            id: "marker".to_string(),
            connection_id: "x".to_string(),
            action_id: "x".to_string(),
            name: "x".to_string(),
            options: Value::Null,
        });

        // The first event seen is the marker, not a rewrite of "a"
        let event = watcher.next().await.unwrap();
        assert!(matches!(event, WatchEvent::Change(Change::Inserted(ref d)) if d.id == "marker"));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_rejected() {
        let host = host_with(Arc::new(Store::in_memory()));
        let result = host.admit(&Register {
            api_version: crate::rpc::API_VERSION.to_string(),
            connection_id: "ghost".to_string(),
            token: AuthToken::generate().to_hex(),
        });
        assert!(matches!(result, Err(Rejection::UnexpectedConnection(_))));
    }

    #[tokio::test]
    async fn test_missing_module_sets_error_status() {
        let store = Arc::new(Store::in_memory());
        store.connections.upsert(Connection::new("conn1", "not-installed"));
        let host = host_with(Arc::clone(&store));

        host.restart_now("conn1").await.unwrap();

        assert_eq!(host.connection_phase("conn1"), None);
        let status = host.connection_status("conn1").unwrap();
        assert_eq!(status.status, StatusLevel::Error);
    }

    #[tokio::test]
    async fn test_disabled_connection_is_not_started() {
        let store = Arc::new(Store::in_memory());
        let mut connection = Connection::new("conn1", "anything");
        connection.enabled = false;
        store.connections.upsert(connection);
        let host = host_with(Arc::clone(&store));

        host.restart_now("conn1").await.unwrap();
        assert!(host.active_connections().is_empty());
        assert_eq!(host.connection_status("conn1"), None);
    }

    #[tokio::test]
    async fn test_module_calls_update_status_and_reject_reregister() {
        let store = Arc::new(Store::in_memory());
        let host = host_with(Arc::clone(&store));
        let calls = ModuleCalls {
            host: Arc::downgrade(&host.inner),
            connection_id: "conn1".to_string(),
        };

        calls
            .handle_call(
                "set-status".to_string(),
                json!({"status": "warning", "message": "low battery"}),
            )
            .await
            .unwrap();
        let status = host.connection_status("conn1").unwrap();
        assert_eq!(status.status, StatusLevel::Warning);
        assert_eq!(status.message.as_deref(), Some("low battery"));

        calls
            .handle_call(
                "log-message".to_string(),
                json!({"level": "info", "message": "hello"}),
            )
            .await
            .unwrap();

        let err = calls
            .handle_call(
                "register".to_string(),
                json!({"apiVersion": "1.0.0", "connectionId": "conn1", "token": "x"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err, "already registered");
    }

    #[test]
    fn test_overlapping_declarations_never_merge() {
        let store = Store::in_memory();
        for _ in 0..200 {
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    replace_action_definitions(&store, "conn1", vec![declare("a", "Alpha")])
                        .unwrap();
                });
                replace_action_definitions(&store, "conn1", vec![declare("b", "Beta")]).unwrap();
            });
            let rows = store.action_definitions.find(|d| d.connection_id == "conn1");
            assert_eq!(rows.len(), 1, "catalogues merged: {rows:?}");
        }
    }

    #[tokio::test]
    async fn test_work_is_claimed_and_delivered() {
        let store = Arc::new(Store::in_memory());
        let (channel, _module, module_calls) = module_link();
        store.work_tasks.upsert(WorkTask::new("conn1", remove_feedback("f0")));
        store.work_tasks.upsert(WorkTask::new("other", remove_feedback("fx")));

        tokio::spawn(consume_work(Arc::clone(&store), "conn1".to_string(), channel.clone()));
        assert!(eventually(|| module_calls.len() == 1).await);

        // Queued after the consumer is already watching
        store.work_tasks.upsert(WorkTask::new("conn1", remove_feedback("f1")));
        assert!(eventually(|| module_calls.len() == 2).await);

        assert_eq!(
            module_calls.calls(),
            vec![
                ("remove-feedback".to_string(), json!({"feedbackId": "f0"})),
                ("remove-feedback".to_string(), json!({"feedbackId": "f1"})),
            ]
        );
        let left = store.work_tasks.list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].connection_id, "other");
        channel.close();
    }

    #[tokio::test]
    async fn test_delayed_action_is_claimed_before_it_runs() {
        let store = Arc::new(Store::in_memory());
        let (channel, _module, module_calls) = module_link();
        tokio::spawn(consume_work(Arc::clone(&store), "conn1".to_string(), channel.clone()));

        store.work_tasks.upsert(WorkTask::new(
            "conn1",
            WorkPayload::ExecuteAction {
                control_id: "c1".to_string(),
                entry_id: "e1".to_string(),
                action_id: "go".to_string(),
                options: json!({"n": 1}),
                delay_ms: 300,
            },
        ));

        assert!(eventually(|| store.work_tasks.is_empty()).await);
        assert_eq!(module_calls.len(), 0);

        assert!(eventually(|| module_calls.len() == 1).await);
        let (method, payload) = module_calls.calls().remove(0);
        assert_eq!(method, "execute-action");
        assert_eq!(
            payload,
            json!({"controlId": "c1", "actionId": "go", "options": {"n": 1}})
        );
        channel.close();
    }

    #[tokio::test]
    async fn test_gate_checks_token_and_single_registration() {
        let host = host_with(Arc::new(Store::in_memory()));
        let (token, _supervisor) = expect_connection(&host, "conn1", ProcessSpec::new("/bin/true"));

        assert_eq!(
            host.admit(&register(&AuthToken::generate().to_hex())).err(),
            Some(Rejection::BadToken("conn1".to_string()))
        );
        assert!(host.admit(&register(&token)).is_ok());
        assert_eq!(
            host.admit(&register(&token)).err(),
            Some(Rejection::AlreadyRegistered("conn1".to_string()))
        );

        host.inner.connections.get_mut("conn1").unwrap().phase = ConnectionPhase::Stopping;
        assert_eq!(
            host.admit(&register(&token)).err(),
            Some(Rejection::UnexpectedConnection("conn1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_silent_process_is_killed_at_registration_deadline() {
        let host = host_with(Arc::new(Store::in_memory()));
        let (_token, supervisor) = expect_connection(
            &host,
            "conn1",
            ProcessSpec::new("/bin/sh").arg("-c").arg("sleep 30"),
        );
        let mut events = supervisor.subscribe();
        supervisor.start();

        let crashed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SupervisorEvent::Crashed { generation, reason }) = events.recv().await {
                    return (generation, reason);
                }
            }
        })
        .await
        .expect("process was never killed");
        assert_eq!(crashed, (1, "registration deadline expired".to_string()));

        // The restarted incarnation runs under its own deadline
        let restarted = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SupervisorEvent::Started { generation: 2, .. }) = events.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(restarted.is_ok());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_update_config_requires_registration() {
        let store = Arc::new(Store::in_memory());
        store.connections.upsert(Connection::new("conn1", "m"));
        let host = host_with(store);
        let err = host.update_config("conn1").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
