//! Module process spawning and management
//!
//! Starts module executables as separate processes with their output piped
//! back to the daemon.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Duration;

use crate::module::registry::DiscoveredModule;
use crate::module::traits::ModuleError;
use crate::severity::Notifier;

/// Spawns module processes
#[derive(Debug, Clone)]
pub struct ModuleProcessSpawner {
    /// How long a fresh process must survive to count as started
    startup_wait: Duration,
    /// uid/gid module processes run as, if different from the daemon's
    identity: Option<(u32, u32)>,
    notifier: Notifier,
}

impl ModuleProcessSpawner {
    pub fn new(startup_wait: Duration, notifier: Notifier) -> Self {
        Self {
            startup_wait,
            identity: None,
            notifier,
        }
    }

    /// Run module processes as `uid`/`gid`
    pub fn with_identity(mut self, uid: u32, gid: u32) -> Self {
        self.identity = Some((uid, gid));
        self
    }

    /// Spawn a module process
    ///
    /// The module gets `MODULE_NAME` and one `MODULE_CONFIG_<KEY>` variable
    /// per configured setting. A process that exits unsuccessfully within the
    /// startup window counts as a failed load.
    pub async fn spawn(
        &self,
        module: &DiscoveredModule,
        config: &HashMap<String, String>,
    ) -> Result<ModuleProcess, ModuleError> {
        if !module.path.exists() {
            return Err(ModuleError::ModuleNotFound(module.path.display().to_string()));
        }

        let mut command = Command::new(&module.path);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("MODULE_NAME", &module.name);

        for (key, value) in config {
            command.env(format!("MODULE_CONFIG_{}", key.to_uppercase()), value);
        }

        #[cfg(unix)]
        {
            // Own process group, so helpers the module starts are signalled with it
            command.process_group(0);
            if let Some((uid, gid)) = self.identity {
                command.uid(uid).gid(gid);
            }
        }

        self.notifier.debug(format!(
            "Spawning module {} from {}",
            module.name,
            module.path.display()
        ));

        let mut child = command.spawn().map_err(|e| ModuleError::SpawnFailed {
            name: module.name.clone(),
            reason: e.to_string(),
        })?;

        tokio::time::sleep(self.startup_wait).await;

        if let Some(status) = child.try_wait()? {
            if !status.success() {
                return Err(ModuleError::StartupFailed {
                    name: module.name.clone(),
                    status: describe_exit(&status),
                });
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(ModuleProcess {
            module_name: module.name.clone(),
            process: child,
            stdout,
            stderr,
            notifier: self.notifier.clone(),
        })
    }
}

/// Running module process
#[derive(Debug)]
pub struct ModuleProcess {
    pub module_name: String,
    process: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    notifier: Notifier,
}

impl ModuleProcess {
    pub fn id(&self) -> Option<u32> {
        self.process.id()
    }

    /// Record stream of the module
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Notification stream of the module
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    pub fn is_running(&mut self) -> bool {
        !matches!(self.process.try_wait(), Ok(Some(_)))
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, ModuleError> {
        self.process
            .wait()
            .await
            .map_err(|e| ModuleError::OperationError(format!("Failed to wait for process: {}", e)))
    }

    /// Ask the module to stop (SIGTERM to its process group)
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.process.id() {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    self.notifier
                        .warning(format!("Can't signal module {}: {}", self.module_name, e));
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = self.process.start_kill() {
                self.notifier
                    .warning(format!("Can't stop module {}: {}", self.module_name, e));
            }
        }
    }

    /// Kill the module and everything in its process group
    pub async fn kill(&mut self) {
        self.notifier
            .debug(format!("Killing module process: {}", self.module_name));

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.process.id() {
                // ESRCH: the whole group is already gone
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    if e != nix::errno::Errno::ESRCH {
                        self.notifier
                            .warning(format!("Can't kill module {}: {}", self.module_name, e));
                    }
                }
            }
        }

        if let Err(e) = self.process.kill().await {
            self.notifier.warning(format!(
                "Can't kill module process {}: {}",
                self.module_name, e
            ));
        }
    }
}

/// Exit code, or the terminating signal on Unix
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return code.to_string();
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    "unknown".to_string()
}
