//! Shared helpers for integration tests

#![allow(dead_code)]

use gpsd_tcp::config::ListenerConfig;
use gpsd_tcp::{Controller, ControllerError, ControllerState, GpsdTcpConfig, Notification};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

/// Write an executable shell-script module
pub fn write_module(dir: &Path, file: &str, script: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Module that emits `lines` once `$MODULE_CONFIG_TRIGGER` exists, then idles
pub fn triggered_module(name: &str, lines: &[&str]) -> String {
    let mut script = format!(
        "#!/bin/sh\n# GPSD_TCP_EXTENSION:{}\n\
         while [ ! -f \"$MODULE_CONFIG_TRIGGER\" ]; do sleep 0.05; done\n",
        name
    );
    for line in lines {
        script.push_str(&format!("echo '{}'\n", line));
    }
    script.push_str("exec sleep 30\n");
    script
}

pub fn free_port() -> i64 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port() as i64
}

pub fn listener(address: &str, port: i64) -> ListenerConfig {
    ListenerConfig {
        protocol: "IPv4".to_string(),
        address: address.to_string(),
        port,
    }
}

/// Configuration with fast module timings and the given module directory
pub fn test_config(module_dir: &Path, listeners: Vec<ListenerConfig>) -> GpsdTcpConfig {
    let mut config = GpsdTcpConfig::default();
    config.modules.dir = module_dir.to_path_buf();
    config.modules.startup_wait_ms = 20;
    config.modules.stop_grace_ms = 500;
    config.listeners = listeners;
    config
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(note) = rx.try_recv() {
        seen.push(note);
    }
    seen
}

/// A controller running on a background task
pub struct Running {
    pub state: watch::Receiver<ControllerState>,
    pub addrs: Vec<SocketAddr>,
    pub registry: gpsd_tcp::network::ClientRegistry,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ControllerError>>,
}

impl Running {
    /// Start `controller` and wait until it accepts clients
    pub async fn start(controller: Controller) -> Self {
        let mut state = controller.state();
        let mut addrs = controller.listener_addrs();
        let registry = controller.registry();
        let (stop, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(controller.run(async move {
            let _ = stop_rx.await;
        }));

        tokio::time::timeout(WAIT, state.wait_for(|s| *s == ControllerState::Running))
            .await
            .expect("controller did not reach Running")
            .unwrap();
        let addrs = addrs.borrow_and_update().clone();

        Self {
            state,
            addrs,
            registry,
            stop: Some(stop),
            task,
        }
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.registry.active_count().await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count not reached");
    }

    pub async fn shutdown(mut self) -> Result<(), ControllerError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("controller did not stop")
            .unwrap()
    }
}
