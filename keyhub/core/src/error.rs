//! Hub Error Taxonomy
//!
//! Every fallible operation in the hub returns [`HubError`]. Subsystems with
//! richer failure detail (RPC, configuration) keep their own error enums and
//! convert into this one at their boundary.

use thiserror::Error;

use crate::rpc::RpcError;

/// Result alias used throughout the crate
pub type HubResult<T> = Result<T, HubError>;

/// Errors surfaced by hub operations
#[derive(Debug, Error)]
pub enum HubError {
    /// A referenced entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (collection name)
        kind: &'static str,
        /// Requested id
        id: String,
    },

    /// Credentials or ownership check failed
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Operation is not supported for this entity or version
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A bounded wait expired
    #[error("timed out: {0}")]
    Timeout(String),

    /// A transaction precondition failed and nothing was written
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// Peer sent something that does not follow the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An entity with the same id already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Entity kind (collection name)
        kind: &'static str,
        /// Conflicting id
        id: String,
    },

    /// The queue, channel or task the operation relied on has shut down
    #[error("closed: {0}")]
    Closed(String),

    /// I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    /// Shorthand for [`HubError::NotFound`]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error means the entity was missing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<RpcError> for HubError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout { method, .. } => Self::Timeout(format!("rpc call {method}")),
            RpcError::Closed => Self::Closed("rpc channel".to_string()),
            RpcError::Unsupported(msg) => Self::Unsupported(msg),
            RpcError::Remote(msg) => Self::Protocol(format!("remote error: {msg}")),
            other => Self::Protocol(other.to_string()),
        }
    }
}
