//! Stored Entities
//!
//! Every document the hub keeps in the [`Store`](crate::store::Store). Field
//! names serialize in camelCase; the change stream reports changed fields by
//! these serialized names (for example `renderHash`).
//!
//! ```text
//!   Connection ──runs──▶ module process
//!        ▲
//!        │ target
//!   ControlDefinition ──1:1──▶ ControlRender / ControlStatus
//!        ▲
//!        │ slot → control
//!   SurfaceSpace.pages[..].slots ◀──bound── SurfaceDevice
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Document;

// =============================================================================
// Connections
// =============================================================================

/// A configured instance of a module; drives one supervised process while enabled
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Connection id
    pub id: String,
    /// Operator-facing label
    pub label: String,
    /// Module this connection runs
    pub module_id: String,
    /// Whether a process should be running
    pub enabled: bool,
    /// Module-defined configuration blob, passed to `init`
    #[serde(default)]
    pub config: Value,
}

impl Connection {
    /// Create an enabled connection with an empty config
    pub fn new(id: impl Into<String>, module_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            module_id: module_id.into(),
            enabled: true,
            config: Value::Object(serde_json::Map::new()),
        }
    }
}

impl Document for Connection {
    const COLLECTION: &'static str = "connections";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Controls
// =============================================================================

/// Kind of control occupying a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlType {
    /// Press/release button with action lists
    Button,
    /// Page navigation placeholder (next page)
    PageUp,
    /// Page navigation placeholder (previous page)
    PageDown,
    /// Page number display
    PageNumber,
}

/// Horizontal text alignment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    /// Left aligned
    Left,
    /// Centered
    #[default]
    Center,
    /// Right aligned
    Right,
}

/// The default visual layer of a button
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ButtonStyle {
    /// Text drawn on the button
    pub text: String,
    /// Text alignment
    pub align: TextAlign,
    /// Text size in points; 0 means automatic
    pub size: u16,
    /// Text colour as 0xRRGGBB
    pub color: u32,
    /// Background colour as 0xRRGGBB
    pub bgcolor: u32,
}

impl Default for ButtonStyle {
    fn default() -> Self {
        Self {
            text: String::new(),
            align: TextAlign::Center,
            size: 0,
            color: 0x00ff_ffff,
            bgcolor: 0x0000_0000,
        }
    }
}

impl ButtonStyle {
    /// Style with the given text and default colours
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One entry of a control's down or up action list
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    /// Entry id, unique within the control
    pub id: String,
    /// Connection whose module executes the action
    pub connection_id: String,
    /// Module-declared action id
    pub action_id: String,
    /// Per-action options
    #[serde(default)]
    pub options: Value,
    /// Delay before execution, in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

/// A control as defined by the operator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlDefinition {
    /// Control id
    pub id: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Control type
    #[serde(rename = "type")]
    pub control_type: ControlType,
    /// Default visual layer
    pub style: ButtonStyle,
    /// Changes whenever anything affecting the rendered image changes
    pub render_hash: String,
    /// Liveness field bumped by transactions that need the control to exist
    pub touched_at: DateTime<Utc>,
    /// Actions run on press
    #[serde(default)]
    pub down_actions: Vec<ActionEntry>,
    /// Actions run on release
    #[serde(default)]
    pub up_actions: Vec<ActionEntry>,
}

impl ControlDefinition {
    /// Create a button with the given style and no actions
    pub fn button(id: impl Into<String>, style: ButtonStyle) -> Self {
        let render_hash = render_hash_of(ControlType::Button, &style);
        Self {
            id: id.into(),
            description: String::new(),
            control_type: ControlType::Button,
            style,
            render_hash,
            touched_at: Utc::now(),
            down_actions: Vec::new(),
            up_actions: Vec::new(),
        }
    }

    /// Replace the style and recompute the render hash
    pub fn set_style(&mut self, style: ButtonStyle) {
        self.render_hash = render_hash_of(self.control_type, &style);
        self.style = style;
    }
}

impl Document for ControlDefinition {
    const COLLECTION: &'static str = "controls";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Content hash over everything that affects a control's rendered image
pub fn render_hash_of(control_type: ControlType, style: &ButtonStyle) -> String {
    let mut hasher = crc32fast::Hasher::new();
    // Both types serialize infallibly (no maps with non-string keys)
    if let Ok(bytes) = serde_json::to_vec(&(control_type, style)) {
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize().to_be_bytes())
}

/// Cached rendering of a control; id equals the control id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRender {
    /// Control id
    pub id: String,
    /// Hash of the definition this render was computed from
    pub render_hash: String,
    /// Encoded image, `None` when the control draws nothing
    pub image: Option<String>,
    /// Copy of the style used
    pub style: ButtonStyle,
}

impl Document for ControlRender {
    const COLLECTION: &'static str = "control_renders";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Transient press state; id equals the control id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    /// Control id
    pub id: String,
    /// Whether the control is currently held down
    pub pressed: bool,
}

impl Document for ControlStatus {
    const COLLECTION: &'static str = "control_status";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Work queue
// =============================================================================

/// What a module should do with a work task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkPayload {
    /// Run a module action
    #[serde(rename_all = "camelCase")]
    ExecuteAction {
        /// Control that triggered the action
        control_id: String,
        /// Action entry id within the control
        entry_id: String,
        /// Module-declared action id
        action_id: String,
        /// Action options
        options: Value,
        /// Delay before execution, in milliseconds
        delay_ms: u64,
    },
    /// A feedback was created or its options changed
    #[serde(rename_all = "camelCase")]
    FeedbackUpdate {
        /// Feedback id
        feedback_id: String,
        /// Control the feedback belongs to
        control_id: String,
        /// Module-declared feedback type
        feedback_type: String,
        /// Feedback options
        options: Value,
    },
    /// A feedback was removed
    #[serde(rename_all = "camelCase")]
    FeedbackRemove {
        /// Feedback id
        feedback_id: String,
    },
}

/// A unit of work for one connection's module process
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTask {
    /// Task id
    pub id: String,
    /// Target connection
    pub connection_id: String,
    /// What to do
    pub payload: WorkPayload,
    /// When the task was queued
    pub enqueued_at: DateTime<Utc>,
}

impl WorkTask {
    /// Create a task with a fresh id, stamped now
    pub fn new(connection_id: impl Into<String>, payload: WorkPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

impl Document for WorkTask {
    const COLLECTION: &'static str = "work_tasks";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Spaces
// =============================================================================

/// Cached device shape a space was laid out for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceShape {
    /// Grid columns
    pub columns: u32,
    /// Grid rows
    pub rows: u32,
    /// Device family, e.g. `satellite`
    pub kind: String,
}

/// One page of a space
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Page id
    pub id: String,
    /// Page name
    pub name: String,
    /// Slot id to control id
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
}

/// An ordered set of pages laid out for one device shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceSpace {
    /// Space id
    pub id: String,
    /// Space name
    pub name: String,
    /// Device shape
    pub shape: SpaceShape,
    /// Pages in display order
    #[serde(default)]
    pub pages: Vec<Page>,
}

impl SurfaceSpace {
    /// First page, the one a freshly bound surface shows
    #[must_use]
    pub fn first_page(&self) -> Option<&Page> {
        self.pages.first()
    }
}

impl Document for SurfaceSpace {
    const COLLECTION: &'static str = "spaces";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Surface devices
// =============================================================================

/// Connection status of a surface device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Not attached
    Offline,
    /// Seen but not yet usable
    Detected,
    /// Attached and drawing
    Ready,
    /// Attached but failing
    Error,
}

/// Persistent record of a surface
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceDevice {
    /// Surface id (namespaced by its bridge)
    pub id: String,
    /// Display name
    pub name: String,
    /// Current status
    pub status: DeviceStatus,
    /// Surface host instance that currently owns the device
    pub owner_id: Option<String>,
    /// Stable hardware uid, scoped to the bridge that reported it
    pub uid: String,
    /// Kept while offline when true
    #[serde(default)]
    pub adopted: bool,
    /// Bound space
    #[serde(default)]
    pub space_id: Option<String>,
    /// Last time the device was seen attached
    pub last_seen: DateTime<Utc>,
}

impl Document for SurfaceDevice {
    const COLLECTION: &'static str = "surface_devices";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Action catalogue
// =============================================================================

/// An action a module declared via `set-action-definitions`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    /// Deterministic id from connection id + action id
    pub id: String,
    /// Declaring connection
    pub connection_id: String,
    /// Module-side action id
    pub action_id: String,
    /// Display name
    pub name: String,
    /// Option field descriptors, passed through untouched
    #[serde(default)]
    pub options: Value,
}

impl Document for ActionDefinition {
    const COLLECTION: &'static str = "action_definitions";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Namespace for action definition ids
const ACTION_ID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6b65_7968_7562_4163_7469_6f6e_4465_6673);

/// Deterministic action definition id for a connection's action
pub fn action_definition_id(connection_id: &str, action_id: &str) -> String {
    let name = format!("{connection_id}:{action_id}");
    uuid::Uuid::new_v5(&ACTION_ID_NAMESPACE, name.as_bytes()).to_string()
}
