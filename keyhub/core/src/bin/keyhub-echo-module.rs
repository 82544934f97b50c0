//! Keyhub Echo Module
//!
//! A minimal module that registers with the hub, declares one action and
//! logs every action it is asked to run. Useful as a starting point for
//! module authors and as the child process in integration tests.
//!
//! # Launch Environment
//!
//! The hub starts this binary with:
//!
//! - `KEYHUB_MODULE_SOCKET`: hub RPC socket
//! - `KEYHUB_MODULE_CONNECTION_ID`: connection id to register as
//! - `KEYHUB_MODULE_TOKEN`: launch token
//!
//! # Configuration
//!
//! - `exitAfterInit` (path): if the file does not exist, create it and exit
//!   right after `init`. The next launch finds the file and keeps running.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use keyhub_core::rpc::{
    ActionDeclaration, ConnectionStatus, ExecuteAction, LogLevel, ModuleClient, ModuleHandler,
    StatusLevel,
};

enum Event {
    Init(Value),
    Action(ExecuteAction),
}

struct EchoModule {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl ModuleHandler for EchoModule {
    async fn init(&self, config: Value) -> Result<(), String> {
        self.events
            .send(Event::Init(config))
            .map_err(|_| "module is shutting down".to_string())
    }

    async fn execute_action(&self, action: ExecuteAction) -> Result<(), String> {
        self.events
            .send(Event::Action(action))
            .map_err(|_| "module is shutting down".to_string())
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keyhub_echo_module=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Report status and actions; returns true if the module should exit now
async fn on_init(client: &ModuleClient, config: &Value) -> Result<bool> {
    client
        .set_status(ConnectionStatus {
            status: StatusLevel::Ok,
            message: None,
        })
        .await
        .context("reporting status")?;
    client
        .set_action_definitions(vec![ActionDeclaration {
            id: "echo".to_string(),
            name: "Echo".to_string(),
            options: json!([{"id": "text", "type": "textinput"}]),
        }])
        .await
        .context("declaring actions")?;

    let Some(marker) = config.get("exitAfterInit").and_then(Value::as_str) else {
        return Ok(false);
    };
    let marker = PathBuf::from(marker);
    if marker.exists() {
        return Ok(false);
    }
    std::fs::write(&marker, b"")
        .with_context(|| format!("Failed to create marker: {marker:?}"))?;
    warn!(marker = ?marker, "Exiting after init as configured");
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let client = ModuleClient::from_env(Arc::new(EchoModule { events: events_tx }))
        .await
        .context("registering with the hub")?;
    info!(connection_id = client.connection_id(), "Echo module registered");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::Init(config)) => {
                    if on_init(&client, &config).await? {
                        break;
                    }
                }
                Some(Event::Action(action)) => {
                    let line = format!(
                        "echo {} from {}: {}",
                        action.action_id, action.control_id, action.options
                    );
                    info!("{line}");
                    if let Err(e) = client.log(LogLevel::Info, line).await {
                        warn!(error = %e, "Failed to relay log line");
                    }
                }
                None => break,
            },
            () = client.closed() => {
                info!("Hub closed the connection");
                break;
            }
        }
    }

    client.close();
    Ok(())
}
