//! Module registry and discovery
//!
//! Finds module candidates on disk and validates them before loading.

pub mod discovery;

pub use discovery::{DiscoveredModule, ModuleDiscovery};
