//! Module loading
//!
//! Turns the contents of the module directory into running modules.

pub mod loader;

pub use loader::ModuleLoader;
