//! gpsd-tcp - relays positional data from pluggable source modules to TCP clients
//!
//! The daemon loads data-producing modules from a directory, binds the
//! configured listeners, drops privileges and then relays every record a
//! module produces to every connected client.
//!
//! ## Components
//!
//! - [`severity`]: severity taxonomy and the notification stream
//! - [`module`]: module discovery, loading and process monitoring
//! - [`network`]: listeners, client sessions and the record relay
//! - [`privileges`]: one-shot switch to an unprivileged user/group
//! - [`controller`]: startup, run and shutdown sequencing
//!
//! ## Lifecycle
//!
//! Starting, LoadingModules, BindingListeners, DroppingPrivileges, Ready,
//! Running, Closing, Stopped. A run with no bound listener, or a failed
//! privilege switch, stops before any client is accepted.

pub mod config;
pub mod controller;
pub mod module;
pub mod network;
pub mod privileges;
pub mod severity;
pub mod utils;

pub use config::GpsdTcpConfig;
pub use controller::{Controller, ControllerError, ControllerState};
pub use severity::{Notification, Notifier, Severity};
