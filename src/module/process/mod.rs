//! Process management for modules
//!
//! Every module runs as its own OS process. The spawner starts it, the monitor
//! owns it from then on.

pub mod monitor;
pub mod spawner;

pub use monitor::{ModuleProcessMonitor, OutputCodec, OutputLine};
pub use spawner::{ModuleProcess, ModuleProcessSpawner};
