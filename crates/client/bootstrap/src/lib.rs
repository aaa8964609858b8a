//! Shared bootstrap utilities for client front-ends.
//!
//! Provides environment-driven configuration and engine assembly that can be
//! reused by a CLI, a UI, or any other front-end crate.
pub mod builder;
pub mod config;

pub use builder::{EngineSetup, SyncBuilder};
pub use config::BootstrapConfig;
