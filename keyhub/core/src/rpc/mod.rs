//! Module RPC
//!
//! Each module process connects back to the host over a Unix socket and
//! speaks a correlated request/reply protocol in both directions.
//!
//! # Module Overview
//!
//! - [`frame`]: length-prefixed JSON frames with CRC32
//! - [`protocol`]: envelope and typed calls
//! - [`channel`]: the duplex request/reply engine
//! - [`auth`]: launch tokens
//! - [`server`]: host-side listener and registration handshake
//! - [`client`]: module-side connection (used by module binaries)
//!
//! # Registration
//!
//! The first message on a new socket must be a `register` call. The host
//! checks, in order: API version, that it launched a process for that
//! connection id, that no socket is registered for it yet, and the launch
//! token. Any failure drops the socket without a reply.

pub mod auth;
pub mod channel;
pub mod client;
pub mod frame;
pub mod protocol;
pub mod server;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use auth::AuthToken;
pub use channel::{CallHandler, RpcChannel};
pub use client::{ModuleClient, ModuleHandler};
pub use frame::{FrameDecoder, FrameError};
pub use protocol::{
    ActionDeclaration, ConnectionStatus, Envelope, ExecuteAction, FeedbackUpdate, HostCall,
    LogLevel, ModuleCall, Register, StatusLevel,
};
pub use server::{Admission, RegistrationGate, Rejection, RpcServer};

/// Module API version spoken by this host
pub const API_VERSION: &str = "1.2.0";

/// Environment variable carrying the connection id into a module process
pub const ENV_CONNECTION_ID: &str = "KEYHUB_MODULE_CONNECTION_ID";
/// Environment variable carrying the RPC socket path into a module process
pub const ENV_SOCKET: &str = "KEYHUB_MODULE_SOCKET";
/// Environment variable carrying the launch token into a module process
pub const ENV_TOKEN: &str = "KEYHUB_MODULE_TOKEN";
/// Environment variable carrying the module install path into a module process
pub const ENV_MODULE_PATH: &str = "KEYHUB_MODULE_PATH";

/// Whether a module speaking `version` can talk to this host
///
/// Same major version, minor not newer than ours.
#[must_use]
pub fn is_supported_api_version(version: &str) -> bool {
    let (Ok(theirs), Ok(ours)) = (
        semver::Version::parse(version),
        semver::Version::parse(API_VERSION),
    ) else {
        return false;
    };
    theirs.major == ours.major && theirs.minor <= ours.minor
}

/// RPC errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// No reply arrived in time
    #[error("call {method} (callback {callback}) timed out")]
    Timeout {
        /// Method that was called
        method: String,
        /// Callback number of the call
        callback: u64,
    },

    /// The channel is closed
    #[error("channel closed")]
    Closed,

    /// The peer speaks an API version we do not
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The peer answered with a failure
    #[error("remote error: {0}")]
    Remote(String),

    /// A message could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Socket-level failure
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// RPC settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcConfig {
    /// Unix socket modules connect back to
    pub socket_path: PathBuf,
    /// Timeout for every call made over a channel
    pub call_timeout: Duration,
    /// Deadline for a launched process to register
    pub registration_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            call_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(30),
        }
    }
}

impl RpcConfig {
    /// Set the socket path
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set the call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the registration deadline
    #[must_use]
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }
}

/// Default RPC socket path
///
/// Uses `$XDG_RUNTIME_DIR/keyhub/modules.sock` if available, otherwise
/// `/tmp/keyhub-$UID/modules.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("keyhub").join("modules.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/keyhub-{uid}/modules.sock"))
    }
}
