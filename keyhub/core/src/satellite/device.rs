//! Outbound side of one satellite keypad

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::protocol::quote;
use crate::model::ButtonStyle;
use crate::surface::ClearState;

/// Streaming capabilities declared at `ADD-DEVICE`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Send rendered images
    pub bitmaps: bool,
    /// Send the background colour
    pub colors: bool,
    /// Send the button text
    pub text: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            bitmaps: true,
            colors: false,
            text: false,
        }
    }
}

/// A keypad behind a satellite connection
#[derive(Clone, Debug)]
pub struct SatelliteDevice {
    device_id: String,
    socket_id: u64,
    capabilities: DeviceCapabilities,
    keys_total: u32,
    keys_per_row: u32,
    out: mpsc::Sender<String>,
}

impl SatelliteDevice {
    /// Device writing lines to `out`
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        socket_id: u64,
        capabilities: DeviceCapabilities,
        keys_total: u32,
        keys_per_row: u32,
        out: mpsc::Sender<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            socket_id,
            capabilities,
            keys_total,
            keys_per_row,
            out,
        }
    }

    /// Id as the bridge knows it
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Socket that added the device
    #[must_use]
    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// Declared capabilities
    #[must_use]
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    /// Grid size as `(keys_total, keys_per_row)`
    #[must_use]
    pub fn grid(&self) -> (u32, u32) {
        (self.keys_total, self.keys_per_row)
    }

    fn send(&self, line: String) {
        match self.out.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(device = %self.device_id, "Satellite output queue full, dropping line");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(device = %self.device_id, "Satellite socket gone, dropping output");
            }
        }
    }

    pub(crate) fn set_brightness(&self, percent: u8) {
        self.send(format!(
            "SURFACE-BRIGHTNESS DEVICEID={} VALUE={percent}",
            quote(&self.device_id)
        ));
    }

    pub(crate) fn clear_surface(&self, state: ClearState) {
        self.send(format!(
            "SURFACE-CLEAR DEVICEID={} STATE={state}",
            quote(&self.device_id)
        ));
    }

    pub(crate) fn draw_control(&self, slot_id: &str, style: &ButtonStyle, image: Option<&str>) {
        self.send(control_state_line(
            &self.device_id,
            self.capabilities,
            slot_id,
            style,
            image,
        ));
    }
}

/// `CONTROL-STATE` line for one slot; optional fields follow the capabilities
#[must_use]
pub fn control_state_line(
    device_id: &str,
    capabilities: DeviceCapabilities,
    slot_id: &str,
    style: &ButtonStyle,
    image: Option<&str>,
) -> String {
    let mut line = format!(
        "CONTROL-STATE DEVICEID={} SLOT={}",
        quote(device_id),
        quote(slot_id)
    );
    if capabilities.colors {
        line.push_str(&format!(" COLOR=#{:06x}", style.bgcolor & 0x00ff_ffff));
    }
    if capabilities.bitmaps {
        if let Some(image) = image {
            line.push_str(" BITMAP=");
            line.push_str(image);
        }
    }
    if capabilities.text {
        line.push_str(" TEXT=");
        line.push_str(&BASE64.encode(style.text.as_bytes()));
    }
    line
}
