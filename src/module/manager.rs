//! Module manager for orchestrating all modules
//!
//! Owns every loaded module process. The relay only receives the read side of
//! each module's record channel through [`ModuleManager::take_streams`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ModuleConfig;
use crate::module::loader::ModuleLoader;
use crate::module::process::{ModuleProcessMonitor, ModuleProcessSpawner};
use crate::module::registry::DiscoveredModule;
use crate::module::traits::{ModuleError, ModuleMetadata, ModuleState, ModuleStream};
use crate::severity::Notifier;

/// Module manager coordinates all loaded modules
pub struct ModuleManager {
    config: ModuleConfig,
    spawner: ModuleProcessSpawner,
    monitor: ModuleProcessMonitor,
    /// Capacity of each module's record channel
    module_queue: usize,
    /// Known modules (name -> module), including failed and stopped ones
    modules: Arc<Mutex<HashMap<String, ManagedModule>>>,
    /// Record streams not yet handed to the relay
    streams: Vec<ModuleStream>,
    /// Parent of every module's stop token
    shutdown: CancellationToken,
    notifier: Notifier,
}

/// Managed module instance
struct ManagedModule {
    metadata: ModuleMetadata,
    state: ModuleState,
    /// Monitor task, resolves to the final state
    task: Option<JoinHandle<ModuleState>>,
    stop: CancellationToken,
}

impl ModuleManager {
    pub fn new(config: ModuleConfig, module_queue: usize, notifier: Notifier) -> Self {
        let spawner = ModuleProcessSpawner::new(
            Duration::from_millis(config.startup_wait_ms),
            notifier.clone(),
        );
        let monitor = ModuleProcessMonitor::new(
            notifier.clone(),
            config.max_record_len,
            Duration::from_millis(config.stop_grace_ms),
        )
        .with_data_timeout(Duration::from_secs(config.data_timeout_secs));

        Self {
            config,
            spawner,
            monitor,
            module_queue,
            modules: Arc::new(Mutex::new(HashMap::new())),
            streams: Vec::new(),
            shutdown: CancellationToken::new(),
            notifier,
        }
    }

    /// Start module processes as `uid`/`gid`
    pub fn with_identity(mut self, uid: u32, gid: u32) -> Self {
        self.spawner = self.spawner.with_identity(uid, gid);
        self
    }

    pub fn modules_dir(&self) -> &Path {
        &self.config.dir
    }

    /// Load a discovered module
    ///
    /// On success the module is Loaded and its record stream is queued for
    /// [`take_streams`](Self::take_streams). On failure the module is recorded
    /// as Failed.
    pub async fn load_module(
        &mut self,
        discovered: &DiscoveredModule,
        config: HashMap<String, String>,
    ) -> Result<(), ModuleError> {
        let name = discovered.name.clone();
        self.notifier.debug(format!("Loading module: {}", name));

        {
            let mut modules = self.modules.lock().await;
            if let Some(existing) = modules.get(&name) {
                if matches!(existing.state, ModuleState::Loaded | ModuleState::Validated) {
                    return Err(ModuleError::AlreadyLoaded(name));
                }
            }
            // Not held across the startup window
            modules.insert(
                name.clone(),
                ManagedModule {
                    metadata: discovered.to_metadata(),
                    state: ModuleState::Validated,
                    task: None,
                    stop: CancellationToken::new(),
                },
            );
        }

        let process = match self.spawner.spawn(discovered, &config).await {
            Ok(process) => process,
            Err(e) => {
                if let Some(managed) = self.modules.lock().await.get_mut(&name) {
                    managed.state = ModuleState::Failed(e.to_string());
                }
                return Err(e);
            }
        };

        let (records_tx, records_rx) = mpsc::channel(self.module_queue);
        let stop = self.shutdown.child_token();
        let monitor = self.monitor.clone();
        let registry = Arc::clone(&self.modules);
        let task_name = name.clone();
        let task_stop = stop.clone();

        let mut modules = self.modules.lock().await;
        let task = tokio::spawn(async move {
            let state = monitor.run(process, records_tx, task_stop).await;
            if let Some(managed) = registry.lock().await.get_mut(&task_name) {
                managed.state = state.clone();
            }
            state
        });

        modules.insert(
            name.clone(),
            ManagedModule {
                metadata: discovered.to_metadata(),
                state: ModuleState::Loaded,
                task: Some(task),
                stop,
            },
        );
        drop(modules);

        self.streams.push(ModuleStream {
            name: name.clone(),
            records: records_rx,
        });

        self.notifier.info(format!("Module {} loaded.", name));
        Ok(())
    }

    /// Record a module the scan produced but that is not going to be loaded
    ///
    /// Leaves modules the manager already knows untouched.
    pub async fn track_discovered(&self, discovered: &DiscoveredModule) {
        let mut modules = self.modules.lock().await;
        modules
            .entry(discovered.name.clone())
            .or_insert_with(|| ManagedModule {
                metadata: discovered.to_metadata(),
                state: ModuleState::Discovered,
                task: None,
                stop: CancellationToken::new(),
            });
    }

    /// Unload a module (stop its process and wait for it)
    pub async fn unload_module(&mut self, module_name: &str) -> Result<(), ModuleError> {
        let (task, stop, metadata) = {
            let mut modules = self.modules.lock().await;
            let managed = modules
                .get_mut(module_name)
                .ok_or_else(|| ModuleError::ModuleNotFound(module_name.to_string()))?;
            (managed.task.take(), managed.stop.clone(), managed.metadata.clone())
        };

        let Some(task) = task else {
            return Ok(());
        };

        self.notifier.debug(format!(
            "Unloading module: {} ({})",
            metadata.name,
            metadata.path.display()
        ));
        stop.cancel();
        let state = task
            .await
            .map_err(|e| ModuleError::OperationError(format!("Module task failed: {}", e)))?;

        if let Some(managed) = self.modules.lock().await.get_mut(module_name) {
            managed.state = state;
        }
        self.notifier.info(format!("Module {} unloaded.", module_name));
        Ok(())
    }

    /// Discover and load every module in the module directory
    ///
    /// Returns the number of modules loaded.
    pub async fn auto_load_modules(&mut self) -> usize {
        let loader = ModuleLoader::from_config(&self.config, self.notifier.clone());
        loader.load_all(self).await
    }

    /// Hand the record streams of newly loaded modules to the caller
    pub fn take_streams(&mut self) -> Vec<ModuleStream> {
        std::mem::take(&mut self.streams)
    }

    /// Names of all known modules, sorted
    pub async fn list_modules(&self) -> Vec<String> {
        let modules = self.modules.lock().await;
        let mut names: Vec<String> = modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn module_state(&self, module_name: &str) -> Option<ModuleState> {
        let modules = self.modules.lock().await;
        modules.get(module_name).map(|m| m.state.clone())
    }

    /// Number of modules currently Loaded
    pub async fn loaded_count(&self) -> usize {
        let modules = self.modules.lock().await;
        modules
            .values()
            .filter(|m| m.state == ModuleState::Loaded)
            .count()
    }

    /// Stop all modules
    ///
    /// Every module is signalled at once, then each is waited for. Their
    /// record streams end as the processes go away.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();

        let tasks: Vec<(String, JoinHandle<ModuleState>)> = {
            let mut modules = self.modules.lock().await;
            modules
                .iter_mut()
                .filter_map(|(name, m)| m.task.take().map(|task| (name.clone(), task)))
                .collect()
        };

        for (name, task) in tasks {
            match task.await {
                Ok(state) => {
                    if let Some(managed) = self.modules.lock().await.get_mut(&name) {
                        managed.state = state;
                    }
                    self.notifier.info(format!("Module {} unloaded.", name));
                }
                Err(e) => {
                    self.notifier
                        .warning(format!("Error unloading module {}: {}", name, e));
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::severity::Severity;
    use std::os::unix::fs::PermissionsExt;

    fn write_module(dir: &Path, file: &str, body: &str) -> DiscoveredModule {
        let path = dir.join(file);
        std::fs::write(&path, format!("#!/bin/sh\n# GPSD_TCP_EXTENSION\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        DiscoveredModule {
            name: path.file_stem().unwrap().to_string_lossy().into_owned(),
            path,
        }
    }

    fn manager(dir: &Path) -> ModuleManager {
        let config = ModuleConfig {
            dir: dir.to_path_buf(),
            startup_wait_ms: 20,
            stop_grace_ms: 500,
            ..ModuleConfig::default()
        };
        ModuleManager::new(config, 16, Notifier::new(Severity::Debug))
    }

    #[tokio::test]
    async fn test_load_and_unload() {
        let dir = tempfile::tempdir().unwrap();
        let module = write_module(dir.path(), "idle.module", "exec sleep 30");
        let mut manager = manager(dir.path());

        manager.load_module(&module, HashMap::new()).await.unwrap();
        assert_eq!(manager.module_state("idle").await, Some(ModuleState::Loaded));
        assert_eq!(manager.loaded_count().await, 1);
        assert_eq!(manager.take_streams().len(), 1);
        assert!(manager.take_streams().is_empty());

        let err = manager.load_module(&module, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ModuleError::AlreadyLoaded(_)));

        manager.unload_module("idle").await.unwrap();
        assert_eq!(manager.module_state("idle").await, Some(ModuleState::Stopped));

        // A scanned module that was never selected
        let spare = write_module(dir.path(), "spare.module", "exec sleep 30");
        manager.track_discovered(&spare).await;
        manager.track_discovered(&module).await;
        assert_eq!(manager.module_state("spare").await, Some(ModuleState::Discovered));
        assert_eq!(manager.module_state("idle").await, Some(ModuleState::Stopped));
        assert_eq!(manager.loaded_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_load_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let module = write_module(dir.path(), "broken.module", "exit 1");
        let mut manager = manager(dir.path());
        // Give the process time to exit inside the startup window
        manager.spawner =
            ModuleProcessSpawner::new(Duration::from_millis(300), Notifier::new(Severity::Debug));

        assert!(manager.load_module(&module, HashMap::new()).await.is_err());
        assert!(matches!(
            manager.module_state("broken").await,
            Some(ModuleState::Failed(_))
        ));
        assert!(manager.take_streams().is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_module() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        let err = manager.unload_module("ghost").await.unwrap_err();
        assert!(matches!(err, ModuleError::ModuleNotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_modules() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_module(dir.path(), "a.module", "exec sleep 30");
        let b = write_module(dir.path(), "b.module", "while true; do sleep 1; done");
        let mut manager = manager(dir.path());

        manager.load_module(&a, HashMap::new()).await.unwrap();
        manager.load_module(&b, HashMap::new()).await.unwrap();
        let mut streams = manager.take_streams();

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
            .await
            .unwrap();

        assert_eq!(manager.list_modules().await, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(manager.loaded_count().await, 0);
        for stream in streams.iter_mut() {
            assert!(stream.records.recv().await.is_none());
        }
    }
}
