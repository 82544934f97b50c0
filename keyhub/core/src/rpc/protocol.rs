//! RPC Messages
//!
//! Every frame carries one [`Envelope`]. Calls name a method and carry a
//! callback number; the peer answers with a reply bearing the same callback.
//!
//! ```text
//!   module                                    host
//!     │ call register {apiVersion,connectionId,token}  │
//!     │ ─────────────────────────────────────────────▶ │ validate
//!     │ ◀───────────────────────────────────────────── │ reply {registered:true}
//!     │                           call init {config}   │
//!     │ ◀───────────────────────────────────────────── │
//!     │ reply ─────────────────────────────────────────▶│
//!     │ call log-message / set-status / set-action-definitions
//!     │ ─────────────────────────────────────────────▶ │
//! ```
//!
//! Typed calls ([`HostCall`], [`ModuleCall`]) serialize as
//! `{"method": .., "payload": ..}` and are split into the envelope's
//! `method` and `payload` fields.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// One message on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum Envelope {
    /// A request expecting a reply
    Call {
        /// Correlation number chosen by the caller
        callback: u64,
        /// Method name
        method: String,
        /// Method arguments
        #[serde(default)]
        payload: Value,
    },
    /// The answer to a call
    Reply {
        /// Correlation number of the call
        callback: u64,
        /// Whether the call succeeded
        success: bool,
        /// Result value, or an error message string on failure
        #[serde(default)]
        payload: Value,
    },
}

// =============================================================================
// Host → module
// =============================================================================

/// Action execution request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAction {
    /// Control that triggered the action
    pub control_id: String,
    /// Module-declared action id
    pub action_id: String,
    /// Action options
    #[serde(default)]
    pub options: Value,
}

/// Feedback subscription update
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackUpdate {
    /// Feedback id
    pub feedback_id: String,
    /// Control the feedback belongs to
    pub control_id: String,
    /// Module-declared feedback type
    pub feedback_type: String,
    /// Feedback options
    #[serde(default)]
    pub options: Value,
}

/// Calls the host makes into a module
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload", rename_all = "kebab-case")]
pub enum HostCall {
    /// Start working with this configuration
    Init {
        /// Connection config blob
        config: Value,
    },
    /// Shut down cleanly
    Destroy,
    /// Configuration changed while running
    UpdateConfig {
        /// New config blob
        config: Value,
    },
    /// Run an action
    ExecuteAction(ExecuteAction),
    /// Create or update a feedback
    UpdateFeedback(FeedbackUpdate),
    /// Remove a feedback
    #[serde(rename_all = "camelCase")]
    RemoveFeedback {
        /// Feedback id
        feedback_id: String,
    },
}

// =============================================================================
// Module → host
// =============================================================================

/// Registration handshake payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    /// Module API version, semver
    pub api_version: String,
    /// Connection id from the launch environment
    pub connection_id: String,
    /// Launch token from the launch environment
    pub token: String,
}

/// Severity of a module log line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error
    Error,
    /// Warning
    Warn,
    /// Informational
    Info,
    /// Debug
    Debug,
    /// Trace
    Trace,
}

/// Module-reported health
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    /// Working
    Ok,
    /// Working with problems
    Warning,
    /// Not working
    Error,
    /// Configuration is incomplete
    BadConfig,
    /// Not yet known
    Unknown,
}

/// Module-reported status with optional message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Health level
    pub status: StatusLevel,
    /// Detail for the operator
    #[serde(default)]
    pub message: Option<String>,
}

/// One action a module offers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDeclaration {
    /// Module-side action id
    pub id: String,
    /// Display name
    pub name: String,
    /// Option field descriptors
    #[serde(default)]
    pub options: Value,
}

/// Calls a module makes into the host
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload", rename_all = "kebab-case")]
pub enum ModuleCall {
    /// Handshake; must be the first call on a socket
    Register(Register),
    /// Relay a log line
    LogMessage {
        /// Severity
        level: LogLevel,
        /// Text
        message: String,
    },
    /// Report health
    SetStatus(ConnectionStatus),
    /// Replace the module's action catalogue
    SetActionDefinitions {
        /// Every action the module currently offers
        actions: Vec<ActionDeclaration>,
    },
}

/// Split a typed call into envelope `method` and `payload`
///
/// # Errors
///
/// Returns an error if the call does not serialize to a tagged object.
pub fn split_call<C: Serialize>(call: &C) -> Result<(String, Value), serde_json::Error> {
    let mut value = serde_json::to_value(call)?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| serde::ser::Error::custom("call is missing a method tag"))?;
    let payload = value
        .as_object_mut()
        .and_then(|obj| obj.remove("payload"))
        .unwrap_or(Value::Null);
    Ok((method, payload))
}

/// Join an envelope `method` and `payload` back into a typed call
///
/// # Errors
///
/// Returns an error for unknown methods or payloads of the wrong shape.
pub fn join_call<C: DeserializeOwned>(method: &str, payload: Value) -> Result<C, serde_json::Error> {
    let mut obj = serde_json::Map::new();
    obj.insert("method".to_string(), Value::String(method.to_string()));
    if !payload.is_null() {
        obj.insert("payload".to_string(), payload);
    }
    serde_json::from_value(Value::Object(obj))
}
