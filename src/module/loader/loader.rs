//! Module loader implementation
//!
//! Discovers modules and loads them into a [`ModuleManager`] in file-name
//! order. Load failures are reported and skipped, never fatal.

use std::collections::HashMap;

use crate::config::ModuleConfig;
use crate::module::manager::ModuleManager;
use crate::module::registry::{DiscoveredModule, ModuleDiscovery};
use crate::module::traits::ModuleError;
use crate::severity::Notifier;

/// Module loader for loading and initializing modules
pub struct ModuleLoader {
    discovery: ModuleDiscovery,
    /// Modules to load by name; empty selects everything discovered
    enabled: Vec<String>,
    /// Per-module settings (module name -> key -> value)
    module_configs: HashMap<String, HashMap<String, String>>,
    notifier: Notifier,
}

impl ModuleLoader {
    pub fn new(
        discovery: ModuleDiscovery,
        module_configs: HashMap<String, HashMap<String, String>>,
        notifier: Notifier,
    ) -> Self {
        Self {
            discovery,
            enabled: Vec::new(),
            module_configs,
            notifier,
        }
    }

    /// Restrict loading to the named modules
    pub fn with_enabled(mut self, enabled: Vec<String>) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn from_config(config: &ModuleConfig, notifier: Notifier) -> Self {
        let discovery = ModuleDiscovery::new(&config.dir, &config.extension, notifier.clone());
        Self::new(discovery, config.config.clone(), notifier).with_enabled(config.enabled.clone())
    }

    /// Load a discovered module
    pub async fn load_discovered_module(
        manager: &mut ModuleManager,
        discovered: &DiscoveredModule,
        config: HashMap<String, String>,
    ) -> Result<(), ModuleError> {
        manager.load_module(discovered, config).await
    }

    /// Load the selected modules found in the module directory
    ///
    /// Returns how many modules were loaded; zero is a valid outcome.
    pub async fn load_all(&self, manager: &mut ModuleManager) -> usize {
        for name in &self.enabled {
            self.notifier.info(format!("Module: {}", name));
        }
        let discovered_modules = self.discovery.discover_modules();
        let selected = self.select(&discovered_modules);
        for module in discovered_modules.iter().filter(|m| !selected.contains(m)) {
            manager.track_discovered(module).await;
        }
        self.load_modules_in_order(manager, &selected).await
    }

    /// Pick the enabled modules out of a scan, in configured order
    ///
    /// Every configured name the scan did not produce is reported.
    pub fn select(&self, discovered: &[DiscoveredModule]) -> Vec<DiscoveredModule> {
        if self.enabled.is_empty() {
            return discovered.to_vec();
        }

        let mut selected: Vec<DiscoveredModule> = Vec::with_capacity(self.enabled.len());
        for name in &self.enabled {
            if selected.iter().any(|m| &m.name == name) {
                continue;
            }
            match discovered.iter().find(|m| &m.name == name) {
                Some(module) => selected.push(module.clone()),
                None => self
                    .notifier
                    .error(ModuleError::ModuleNotFound(name.clone()).to_string()),
            }
        }
        selected
    }

    /// Load modules in the given order, skipping those that fail
    pub async fn load_modules_in_order(
        &self,
        manager: &mut ModuleManager,
        discovered_modules: &[DiscoveredModule],
    ) -> usize {
        let mut loaded = 0;

        for discovered in discovered_modules {
            let config = self
                .module_configs
                .get(&discovered.name)
                .cloned()
                .unwrap_or_default();

            match Self::load_discovered_module(manager, discovered, config).await {
                Ok(()) => loaded += 1,
                Err(e) => {
                    self.notifier.error(format!(
                        "{} can't be processed.\n{}",
                        discovered.path.display(),
                        e
                    ));
                }
            }
        }

        if discovered_modules.is_empty() {
            self.notifier.info("No modules discovered");
        }
        loaded
    }
}
