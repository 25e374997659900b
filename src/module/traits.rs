//! Module system types
//!
//! Defines the module lifecycle, module identity, and the record type modules
//! produce.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

/// Marker a file must contain to be accepted as a gpsd-tcp module
///
/// May be followed by `:` and the module's declared name.
pub const EXTENSION_MARKER: &[u8] = b"GPSD_TCP_EXTENSION";

/// One opaque data record produced by a module
pub type Record = Bytes;

/// Module lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    /// Found by the scan, not selected for loading
    Discovered,
    /// Selected and being started
    Validated,
    /// Process running and producing records
    Loaded,
    /// Load failed, or the module died with an error
    Failed(String),
    /// Module ended cleanly or was unloaded
    Stopped,
}

/// Module identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Declared name (unique among loaded modules)
    pub name: String,
    /// Executable the module was loaded from
    pub path: PathBuf,
}

/// Read side of a loaded module's record stream
///
/// The relay holds this; the module itself stays owned by the manager.
#[derive(Debug)]
pub struct ModuleStream {
    pub name: String,
    pub records: mpsc::Receiver<Record>,
}

/// Module system errors
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Module {0} not found.")]
    ModuleNotFound(String),

    #[error("{0} is not a valid gpsd-tcp extension")]
    NotAnExtension(String),

    #[error("Invalid module name: {0}")]
    InvalidName(String),

    #[error("Module {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("Failed to start module {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Module {name} exited during startup with status {status}")]
    StartupFailed { name: String, status: String },

    #[error("Module operation failed: {0}")]
    OperationError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
