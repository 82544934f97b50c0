//! Satellite Protocol Server
//!
//! Remote hardware bridges connect over TCP and speak a line protocol. One
//! bridge connection can carry many keypads; each becomes a surface on the
//! [`SurfaceHost`](crate::surface::SurfaceHost).
//!
//! ```text
//!   bridge ──TCP──▶ session ──ADD-DEVICE──▶ SatelliteDevice ──▶ surface_connected
//!                      │     ──KEY-PRESS───▶ surface_control_input
//!                      ◀──── SURFACE-* / CONTROL-STATE lines (device output)
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: line grammar, tokenizer and reply helpers
//! - [`device`]: the outbound adapter for one keypad
//! - [`server`]: listener and per-socket sessions

pub mod device;
pub mod protocol;
pub mod server;

use std::net::{Ipv4Addr, SocketAddr};

pub use device::{control_state_line, DeviceCapabilities, SatelliteDevice};
pub use protocol::{parse_line, Command, PROTOCOL_VERSION};
pub use server::{SatelliteError, SatelliteServer};

/// Default listen port
pub const DEFAULT_PORT: u16 = 16622;

/// Prefix that namespaces bridge device ids on the hub
pub const DEVICE_ID_PREFIX: &str = "satellite-";

/// `KEYS_TOTAL` when the bridge does not say
pub const DEFAULT_KEYS_TOTAL: u32 = 32;

/// `KEYS_PER_ROW` when the bridge does not say
pub const DEFAULT_KEYS_PER_ROW: u32 = 8;

/// Satellite server settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SatelliteConfig {
    /// Run the server at all
    pub enabled: bool,
    /// Listen address
    pub bind: SocketAddr,
    /// Upper clamp for `KEYS_TOTAL`
    pub max_keys_total: u32,
    /// Upper clamp for `KEYS_PER_ROW`
    pub max_keys_per_row: u32,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_keys_total: 256,
            max_keys_per_row: 32,
        }
    }
}

impl SatelliteConfig {
    /// Loopback on an ephemeral port
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..Self::default()
        }
    }
}

/// Hub-wide id for a bridge's device id
#[must_use]
pub fn hub_device_id(raw: &str) -> String {
    format!("{DEVICE_ID_PREFIX}{raw}")
}
