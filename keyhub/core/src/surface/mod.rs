//! Surfaces: attached devices, the spaces they show, and the adapters that
//! drive them

mod adapter;
mod emulator;
mod host;
mod space;

pub use adapter::{ClearState, SurfaceAdapter};
pub use emulator::{SurfaceCall, VirtualSurface};
pub use host::{DeviceInfo, SurfaceHost};
pub use space::SpaceService;
