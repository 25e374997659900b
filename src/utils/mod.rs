//! Utility modules

pub mod logging;
pub mod signal;
pub mod time;

#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config, log_filter};
pub use signal::ShutdownSignal;
pub use time::current_timestamp;
