//! Host-side RPC listener
//!
//! Accepts module connections on a Unix socket and runs the registration
//! handshake. Admission decisions belong to a [`RegistrationGate`] (the
//! module host); this module only enforces the wire rules.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use super::channel::{CallHandler, RpcChannel};
use super::frame::FrameDecoder;
use super::protocol::{join_call, Envelope, ModuleCall, Register};
use super::{is_supported_api_version, RpcConfig, RpcError};

/// Accepted registration: the handler that serves the module's calls
pub struct Admission {
    /// Serves module → host calls on the new channel
    pub handler: Arc<dyn CallHandler>,
}

/// Why a registration was refused (logged only, never sent to the peer)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// API version not supported
    UnsupportedVersion(String),
    /// No process was launched for this connection id
    UnexpectedConnection(String),
    /// A socket is already registered for this connection id
    AlreadyRegistered(String),
    /// Token does not match the launch token
    BadToken(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "unsupported api version {v}"),
            Self::UnexpectedConnection(id) => write!(f, "no process expected for {id}"),
            Self::AlreadyRegistered(id) => write!(f, "{id} is already registered"),
            Self::BadToken(id) => write!(f, "bad token for {id}"),
        }
    }
}

/// Decides which registrations are accepted
pub trait RegistrationGate: Send + Sync + 'static {
    /// Check a registration and reserve the connection's socket slot
    ///
    /// # Errors
    ///
    /// Returns the reason the registration is refused.
    fn admit(&self, request: &Register) -> Result<Admission, Rejection>;

    /// The channel for an admitted connection is live and acknowledged
    fn registered(&self, connection_id: &str, channel: RpcChannel);
}

/// Run the registration handshake on a fresh stream
///
/// Returns the live channel, or `None` if the stream was dropped.
pub async fn accept_module<S>(
    mut stream: S,
    gate: &dyn RegistrationGate,
    call_timeout: Duration,
) -> Option<RpcChannel>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut decoder = FrameDecoder::new();
    let first = tokio::time::timeout(call_timeout, async {
        let mut buf = [0u8; 4096];
        loop {
            match decoder.decode::<Envelope>() {
                Ok(Some(envelope)) => return Some(envelope),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Malformed first message");
                    return None;
                }
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => decoder.push(&buf[..n]),
            }
        }
    })
    .await;

    let Ok(Some(first)) = first else {
        debug!("No registration received");
        return None;
    };

    let Envelope::Call {
        callback,
        method,
        payload,
    } = first
    else {
        warn!("First message was not a call");
        return None;
    };
    if method != "register" {
        warn!(%method, "First call was not register");
        return None;
    }
    let request = match join_call::<ModuleCall>(&method, payload) {
        Ok(ModuleCall::Register(request)) => request,
        Ok(_) | Err(_) => {
            warn!("Malformed register payload");
            return None;
        }
    };

    if !is_supported_api_version(&request.api_version) {
        let rejection = Rejection::UnsupportedVersion(request.api_version.clone());
        warn!(connection_id = %request.connection_id, %rejection, "Rejected module registration");
        return None;
    }

    let admission = match gate.admit(&request) {
        Ok(admission) => admission,
        Err(rejection) => {
            warn!(connection_id = %request.connection_id, %rejection, "Rejected module registration");
            return None;
        }
    };

    let channel = RpcChannel::spawn(
        stream,
        decoder,
        admission.handler,
        format!("module:{}", request.connection_id),
        call_timeout,
    );
    channel.reply(callback, Ok(json!({"registered": true})));
    info!(connection_id = %request.connection_id, "Module registered");
    gate.registered(&request.connection_id, channel.clone());
    Some(channel)
}

/// Unix socket listener for module connections
pub struct RpcServer {
    config: RpcConfig,
    gate: Arc<dyn RegistrationGate>,
    listener: UnixListener,
}

impl RpcServer {
    /// Bind the module socket (owner-only permissions)
    ///
    /// # Errors
    ///
    /// Returns an error if the socket directory cannot be prepared or the
    /// socket cannot be bound.
    pub fn bind(config: RpcConfig, gate: Arc<dyn RegistrationGate>) -> Result<Self, RpcError> {
        prepare_socket(&config.socket_path)?;
        let listener = UnixListener::bind(&config.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600))?;
        }

        info!(path = ?config.socket_path, "Listening for module connections");
        Ok(Self {
            config,
            gate,
            listener,
        })
    }

    /// Bound socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let gate = Arc::clone(&self.gate);
                        let timeout = self.config.call_timeout;
                        tokio::spawn(
                            async move {
                                accept_module(stream, gate.as_ref(), timeout).await;
                            }
                            .instrument(tracing::info_span!("module_socket")),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        remove_socket(&self.config.socket_path);
        info!("Module listener stopped");
    }
}

/// Create the parent directory and remove a stale socket file
fn prepare_socket(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            info!(path = ?parent, "Created socket directory");
        }
    }
    if path.exists() {
        warn!(path = ?path, "Removing stale socket file");
        fs::remove_file(path)?;
    }
    Ok(())
}

fn remove_socket(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove socket file");
        }
    }
}
