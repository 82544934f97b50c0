//! Keyhub Core - Control Surface Hub
//!
//! Operators define controls (buttons with a style and press/release action
//! lists), place them in slots on surfaces (physical or virtual button
//! grids), and the hub dispatches presses to plugin modules running as
//! supervised child processes. Rendered button images flow back out to
//! every surface showing a control.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Surfaces                                │
//! │   ┌────────────────────┐          ┌──────────────────────────┐   │
//! │   │ Satellite bridges  │          │ Virtual surfaces (tests, │   │
//! │   │  (TCP line proto)  │          │  emulator)               │   │
//! │   └─────────┬──────────┘          └────────────┬─────────────┘   │
//! │             └──────────────┬───────────────────┘                 │
//! │                    SurfaceAdapter / input                        │
//! └────────────────────────────┼─────────────────────────────────────┘
//!                              │
//! ┌────────────────────────────┼─────────────────────────────────────┐
//! │                       KEYHUB CORE                                 │
//! │   SurfaceHost ──press──▶ ControlRunner ──WorkTask──┐             │
//! │        ▲                                            ▼             │
//! │   ControlRender ◀── RenderEngine        ModuleHost ──RPC──▶ module│
//! │        ▲                 ▲                  │        processes    │
//! │        └──── Store (collections + change streams) ◀──┘            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Hub`]: builds and owns every subsystem
//! - [`Store`]: typed collections with change streams and transactions
//! - [`ModuleHost`]: one supervised process per enabled connection
//! - [`RpcChannel`]: correlated request/reply over one socket
//! - [`ControlRunner`]: presses and feedback into work tasks
//! - [`RenderEngine`]: hash-memoized control rendering
//! - [`SurfaceHost`]: per-surface bindings and fan-out
//! - [`SatelliteServer`]: remote keypads over TCP
//!
//! # Module Overview
//!
//! - [`config`]: TOML configuration with env and CLI overrides
//! - [`controls`]: control input dispatch and editing
//! - [`error`]: the crate-wide error taxonomy
//! - [`hub`]: assembly of the running system
//! - [`model`]: persisted document types
//! - [`module`]: module manifests and connection processes
//! - [`queue`]: bounded in-order work queues
//! - [`render`]: the render pipeline
//! - [`rpc`]: module RPC (framing, protocol, channel, server, client)
//! - [`satellite`]: the satellite line protocol server
//! - [`store`]: the document store
//! - [`supervisor`]: child process supervision
//! - [`surface`]: surfaces, spaces and adapters

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod controls;
pub mod error;
pub mod hub;
pub mod model;
pub mod module;
pub mod queue;
pub mod render;
pub mod rpc;
pub mod satellite;
pub mod store;
pub mod supervisor;
pub mod surface;

// Re-exports for convenience
pub use controls::{ControlRunner, ControlService};
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use model::{
    ActionDefinition, ActionEntry, ButtonStyle, Connection, ControlDefinition, ControlRender,
    ControlStatus, ControlType, DeviceStatus, Page, SpaceShape, SurfaceDevice, SurfaceSpace,
    WorkPayload, WorkTask,
};
pub use module::{ConnectionPhase, HostEvent, ModuleHost, ModuleRegistry};
pub use queue::{KeyedQueue, WorkQueue};
pub use render::{RenderEngine, RenderOutcome};
pub use rpc::{ModuleClient, ModuleHandler, RpcChannel, RpcConfig, RpcError, API_VERSION};
pub use satellite::{SatelliteConfig, SatelliteServer};
pub use store::Store;
pub use supervisor::{ProcessSpec, Supervisor, SupervisorConfig};
pub use surface::{DeviceInfo, SpaceService, SurfaceAdapter, SurfaceHost, VirtualSurface};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, HubConfig, HubToml,
};
