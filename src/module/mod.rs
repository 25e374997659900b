//! Module system for gpsd-tcp
//!
//! Data sources are process-isolated modules: executables in the module
//! directory that carry the extension marker. Each stdout line a module writes
//! is one record for the relay; each stderr line is a notification.
//!
//! ## Architecture
//!
//! - **Discovery**: scan the module directory, probe candidates for the marker
//! - **Loading**: spawn each validated module, failures are skipped
//! - **Monitoring**: pump records, forward notifications, stop on shutdown

pub mod loader;
pub mod manager;
pub mod process;
pub mod registry;
pub mod traits;

pub use loader::ModuleLoader;
pub use manager::ModuleManager;
pub use process::{ModuleProcess, ModuleProcessMonitor, ModuleProcessSpawner};
pub use registry::{DiscoveredModule, ModuleDiscovery};
pub use traits::{ModuleError, ModuleMetadata, ModuleState, ModuleStream, Record};
