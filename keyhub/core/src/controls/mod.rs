//! Controls: input dispatch and editing

pub mod runner;
pub mod service;

pub use runner::ControlRunner;
pub use service::ControlService;
