//! Device adapters
//!
//! Every surface kind the hub can drive, as one sum type. Adapter calls are
//! fire-and-forget: a device that has gone away simply drops the output.

use std::fmt;

use crate::model::ButtonStyle;
use crate::satellite::SatelliteDevice;

use super::emulator::VirtualSurface;

/// What a cleared surface should show
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearState {
    /// Bound to a space, nothing drawn yet
    Blank,
    /// Not bound to any space
    Unbound,
}

impl ClearState {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blank => "blank",
            Self::Unbound => "unbound",
        }
    }
}

impl fmt::Display for ClearState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live handle to an attached surface
#[derive(Clone, Debug)]
pub enum SurfaceAdapter {
    /// Remote keypad behind a satellite bridge
    Satellite(SatelliteDevice),
    /// In-process surface (emulator, tests)
    Virtual(VirtualSurface),
}

impl SurfaceAdapter {
    /// Set backlight brightness, 0-100
    pub fn set_brightness(&self, percent: u8) {
        let percent = percent.min(100);
        match self {
            Self::Satellite(device) => device.set_brightness(percent),
            Self::Virtual(surface) => surface.set_brightness(percent),
        }
    }

    /// Clear every slot
    pub fn clear_surface(&self, state: ClearState) {
        match self {
            Self::Satellite(device) => device.clear_surface(state),
            Self::Virtual(surface) => surface.clear_surface(state),
        }
    }

    /// Draw one slot; `image` is the base64 render, absent for a blank slot
    pub fn draw_control(&self, slot_id: &str, style: &ButtonStyle, image: Option<&str>) {
        match self {
            Self::Satellite(device) => device.draw_control(slot_id, style, image),
            Self::Virtual(surface) => surface.draw_control(slot_id, style, image),
        }
    }
}
