//! Modules and their running connections
//!
//! - [`registry`]: installed module manifests
//! - [`host`]: one supervised process per enabled connection, wired to the RPC layer

pub mod host;
pub mod registry;

pub use host::{replace_action_definitions, ConnectionPhase, HostEvent, ModuleHost};
pub use registry::{
    ManifestError, ModuleInfo, ModuleManifest, ModuleRegistry, ModuleRuntime, Provenance,
};
