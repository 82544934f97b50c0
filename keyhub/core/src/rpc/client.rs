//! Module-side connection
//!
//! What a module binary links against: connect back to the host, register
//! with the launch token, then serve [`HostCall`]s through a
//! [`ModuleHandler`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::debug;

use super::channel::{CallHandler, RpcChannel};
use super::frame::FrameDecoder;
use super::protocol::{
    join_call, ActionDeclaration, ConnectionStatus, ExecuteAction, FeedbackUpdate, HostCall,
    LogLevel, ModuleCall, Register,
};
use super::{RpcError, API_VERSION, ENV_CONNECTION_ID, ENV_SOCKET, ENV_TOKEN};

/// Module behaviour, one method per host call
#[async_trait]
pub trait ModuleHandler: Send + Sync + 'static {
    /// Start with this configuration
    async fn init(&self, config: Value) -> Result<(), String>;

    /// Host is shutting the module down
    async fn destroy(&self) -> Result<(), String> {
        Ok(())
    }

    /// Configuration changed while running
    async fn update_config(&self, _config: Value) -> Result<(), String> {
        Ok(())
    }

    /// Run one action
    async fn execute_action(&self, action: ExecuteAction) -> Result<(), String>;

    /// A feedback was created or changed
    async fn update_feedback(&self, _feedback: FeedbackUpdate) -> Result<(), String> {
        Ok(())
    }

    /// A feedback was removed
    async fn remove_feedback(&self, _feedback_id: String) -> Result<(), String> {
        Ok(())
    }
}

struct Dispatcher {
    handler: Arc<dyn ModuleHandler>,
}

#[async_trait]
impl CallHandler for Dispatcher {
    async fn handle_call(&self, method: String, payload: Value) -> Result<Value, String> {
        let call: HostCall =
            join_call(&method, payload).map_err(|e| format!("unsupported call {method}: {e}"))?;
        match call {
            HostCall::Init { config } => self.handler.init(config).await?,
            HostCall::Destroy => self.handler.destroy().await?,
            HostCall::UpdateConfig { config } => self.handler.update_config(config).await?,
            HostCall::ExecuteAction(action) => self.handler.execute_action(action).await?,
            HostCall::UpdateFeedback(feedback) => self.handler.update_feedback(feedback).await?,
            HostCall::RemoveFeedback { feedback_id } => {
                self.handler.remove_feedback(feedback_id).await?;
            }
        }
        Ok(Value::Null)
    }
}

/// A registered module connection
#[derive(Clone, Debug)]
pub struct ModuleClient {
    channel: RpcChannel,
    connection_id: String,
}

impl ModuleClient {
    /// Connect using the launch environment the host provides
    ///
    /// # Errors
    ///
    /// Fails if a launch variable is missing or registration is refused.
    pub async fn from_env(handler: Arc<dyn ModuleHandler>) -> Result<Self, RpcError> {
        let socket = env_var(ENV_SOCKET)?;
        let connection_id = env_var(ENV_CONNECTION_ID)?;
        let token = env_var(ENV_TOKEN)?;
        Self::connect(Path::new(&socket), &connection_id, &token, handler).await
    }

    /// Connect to `socket` and register
    ///
    /// # Errors
    ///
    /// Fails if the socket is unreachable or registration is refused.
    pub async fn connect(
        socket: &Path,
        connection_id: &str,
        token: &str,
        handler: Arc<dyn ModuleHandler>,
    ) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(socket).await?;
        Self::register_stream(
            stream,
            API_VERSION,
            connection_id,
            token,
            handler,
            Duration::from_secs(5),
        )
        .await
    }

    /// Register over an already-open stream
    ///
    /// # Errors
    ///
    /// Fails if the host drops the socket or does not answer in time.
    pub async fn register_stream<S>(
        stream: S,
        api_version: &str,
        connection_id: &str,
        token: &str,
        handler: Arc<dyn ModuleHandler>,
        timeout: Duration,
    ) -> Result<Self, RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = RpcChannel::spawn(
            stream,
            FrameDecoder::new(),
            Arc::new(Dispatcher { handler }),
            "host",
            timeout,
        );

        let request = ModuleCall::Register(Register {
            api_version: api_version.to_string(),
            connection_id: connection_id.to_string(),
            token: token.to_string(),
        });
        if let Err(e) = channel.call_typed(&request).await {
            channel.close();
            return Err(e);
        }
        debug!(connection_id, "Registered with host");

        Ok(Self {
            channel,
            connection_id: connection_id.to_string(),
        })
    }

    /// Connection id this client registered as
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Relay a log line to the host
    ///
    /// # Errors
    ///
    /// Fails if the host does not acknowledge.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<(), RpcError> {
        self.channel
            .call_typed(&ModuleCall::LogMessage {
                level,
                message: message.into(),
            })
            .await
            .map(drop)
    }

    /// Report health
    ///
    /// # Errors
    ///
    /// Fails if the host does not acknowledge.
    pub async fn set_status(&self, status: ConnectionStatus) -> Result<(), RpcError> {
        self.channel
            .call_typed(&ModuleCall::SetStatus(status))
            .await
            .map(drop)
    }

    /// Replace the action catalogue
    ///
    /// # Errors
    ///
    /// Fails if the host does not acknowledge.
    pub async fn set_action_definitions(
        &self,
        actions: Vec<ActionDeclaration>,
    ) -> Result<(), RpcError> {
        self.channel
            .call_typed(&ModuleCall::SetActionDefinitions { actions })
            .await
            .map(drop)
    }

    /// Resolve once the host connection is gone
    pub async fn closed(&self) {
        self.channel.closed().await;
    }

    /// Disconnect
    pub fn close(&self) {
        self.channel.close();
    }
}

fn env_var(name: &str) -> Result<String, RpcError> {
    std::env::var(name).map_err(|_| RpcError::Io(format!("{name} is not set")))
}
