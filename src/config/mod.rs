//! Configuration management for gpsd-tcp
//!
//! Handles configuration loading and validation. Every field has a default so a
//! partial file (or no file at all) yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default TCP port of gpsd-compatible services
pub const DEFAULT_PORT: i64 = 2947;

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsdTcpConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Module discovery and hosting
    #[serde(default)]
    pub modules: ModuleConfig,

    /// Requested listeners, in order
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,

    /// Identity to switch to once listeners are bound
    #[serde(default)]
    pub privileges: PrivilegeConfig,

    /// Fan-out tuning
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Default for GpsdTcpConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            modules: ModuleConfig::default(),
            listeners: default_listeners(),
            privileges: PrivilegeConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Requested severity level (free-form; unknown values fall back to info)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Raw tracing filter, overrides the filter derived from `level`
    /// (RUST_LOG still takes precedence). Notifications use the target
    /// `gpsd_tcp::notification`.
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            json_format: false,
        }
    }
}

/// Module system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Directory scanned (non-recursively) for modules
    #[serde(default = "default_modules_dir")]
    pub dir: PathBuf,

    /// File extension identifying module candidates
    #[serde(default = "default_module_extension")]
    pub extension: String,

    /// Names of the modules to load; empty loads every module found
    #[serde(default)]
    pub enabled: Vec<String>,

    /// How long a freshly spawned module must stay up to count as loaded
    #[serde(default = "default_startup_wait_ms")]
    pub startup_wait_ms: u64,

    /// Grace period between SIGTERM and kill on unload
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Report a module that produced no record for this long (0 = never)
    #[serde(default)]
    pub data_timeout_secs: u64,

    /// Longest record line accepted from a module
    #[serde(default = "default_max_record_len")]
    pub max_record_len: usize,

    /// Module-specific settings, passed as MODULE_CONFIG_<KEY> environment variables
    #[serde(default)]
    pub config: HashMap<String, HashMap<String, String>>,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("/usr/lib/gpsd-tcp")
}

fn default_module_extension() -> String {
    "module".to_string()
}

fn default_startup_wait_ms() -> u64 {
    100
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_max_record_len() -> usize {
    4096
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            dir: default_modules_dir(),
            extension: default_module_extension(),
            enabled: Vec::new(),
            startup_wait_ms: default_startup_wait_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            data_timeout_secs: 0,
            max_record_len: default_max_record_len(),
            config: HashMap::new(),
        }
    }
}

/// One requested listener
///
/// Values are kept loose (string address, signed port) so that bad entries
/// reach the listener manager and are reported there instead of failing the
/// whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Label used in log output only
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: i64,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

fn default_port() -> i64 {
    DEFAULT_PORT
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig {
        protocol: "IPv4".to_string(),
        address: "127.0.0.1".to_string(),
        port: DEFAULT_PORT,
    }]
}

/// Unprivileged identity (empty = no change)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivilegeConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Records buffered per client before new ones are dropped
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,

    /// Records buffered per module before the module's reader waits
    #[serde(default = "default_module_queue")]
    pub module_queue: usize,
}

fn default_session_queue() -> usize {
    64
}

fn default_module_queue() -> usize {
    256
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session_queue: default_session_queue(),
            module_queue: default_module_queue(),
        }
    }
}

impl GpsdTcpConfig {
    /// Load configuration from file
    ///
    /// `.json` files are read as JSON, everything else as TOML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: GpsdTcpConfig = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Invalid JSON in {}: {}", path.display(), e))?
        } else {
            toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Invalid TOML in {}: {}", path.display(), e))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn from_file_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// Listener entries are deliberately not checked here; invalid ones are
    /// skipped individually at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.relay.session_queue == 0 {
            return Err(anyhow::anyhow!("relay.session_queue must be greater than 0"));
        }
        if self.relay.module_queue == 0 {
            return Err(anyhow::anyhow!("relay.module_queue must be greater than 0"));
        }
        if self.modules.max_record_len == 0 {
            return Err(anyhow::anyhow!("modules.max_record_len must be greater than 0"));
        }
        if self.modules.extension.is_empty() || self.modules.extension.contains('.') {
            return Err(anyhow::anyhow!(
                "modules.extension must be a bare extension such as \"module\", got {:?}",
                self.modules.extension
            ));
        }
        Ok(())
    }

    /// Settings for one module, empty when none are configured
    pub fn module_settings(&self, module_name: &str) -> HashMap<String, String> {
        self.modules
            .config
            .get(module_name)
            .cloned()
            .unwrap_or_default()
    }
}
