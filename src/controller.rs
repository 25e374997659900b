//! Daemon controller
//!
//! Sequences startup (modules, listeners, privileges), runs the accept loops
//! and the relay, and shuts everything down in order when the shutdown future
//! resolves.

use futures::FutureExt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::GpsdTcpConfig;
use crate::module::ModuleManager;
use crate::network::listener::{ListenerManager, ListenerSpec};
use crate::network::relay::RelayDispatcher;
use crate::network::session::{accept_loop, ClientRegistry};
use crate::privileges::{IdentityOps, PrivilegeError, PrivilegeManager, SystemIdentity};
use crate::severity::Notifier;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    LoadingModules,
    BindingListeners,
    DroppingPrivileges,
    Ready,
    Running,
    Closing,
    Stopped,
}

/// Fatal startup errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("No service could be started.")]
    NoListeners,

    #[error(transparent)]
    Privileges(#[from] PrivilegeError),
}

/// Top-level orchestrator
pub struct Controller {
    config: GpsdTcpConfig,
    notifier: Notifier,
    identity_ops: Box<dyn IdentityOps>,
    registry: ClientRegistry,
    state_tx: watch::Sender<ControllerState>,
    addrs_tx: watch::Sender<Vec<SocketAddr>>,
}

impl Controller {
    pub fn new(config: GpsdTcpConfig, notifier: Notifier) -> Self {
        let registry = ClientRegistry::new(config.relay.session_queue);
        let (state_tx, _) = watch::channel(ControllerState::Starting);
        let (addrs_tx, _) = watch::channel(Vec::new());

        Self {
            config,
            notifier,
            identity_ops: Box::new(SystemIdentity),
            registry,
            state_tx,
            addrs_tx,
        }
    }

    /// Replace the system identity calls used for the privilege drop
    pub fn with_identity_ops(mut self, ops: Box<dyn IdentityOps>) -> Self {
        self.identity_ops = ops;
        self
    }

    /// Current state, updated on every transition
    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Bound listener addresses, published once the controller is Ready
    pub fn listener_addrs(&self) -> watch::Receiver<Vec<SocketAddr>> {
        self.addrs_tx.subscribe()
    }

    /// Live client sessions
    pub fn registry(&self) -> ClientRegistry {
        self.registry.clone()
    }

    /// Run the daemon until `shutdown` resolves
    ///
    /// Returns an error only for fatal startup failures, after whatever was
    /// already started has been shut down again. `shutdown` is also checked
    /// between startup phases; if it has resolved by then, startup stops and
    /// whatever already runs is shut down in order.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Controller {
            config,
            notifier,
            identity_ops,
            registry,
            state_tx,
            addrs_tx,
        } = self;
        let set_state = |state: ControllerState| {
            notifier.debug(format!("Controller state: {:?}", state));
            state_tx.send_replace(state);
        };
        let mut shutdown = std::pin::pin!(shutdown);

        set_state(ControllerState::Starting);
        notifier.info("starting ...");

        // Modules
        set_state(ControllerState::LoadingModules);
        notifier.info(format!("Module path: {}", config.modules.dir.display()));

        let privileges =
            PrivilegeManager::with_ops(&config.privileges, identity_ops, notifier.clone());

        let mut modules = ModuleManager::new(
            config.modules.clone(),
            config.relay.module_queue,
            notifier.clone(),
        );
        if running_as_root() {
            // Module processes start before the drop; give them the target identity directly
            if let Some((uid, gid)) = privileges.target_ids() {
                modules = modules.with_identity(uid, gid);
            }
        }
        modules.auto_load_modules().await;
        let streams = modules.take_streams();

        if requested(shutdown.as_mut()) {
            set_state(ControllerState::Closing);
            notifier.info("closing ...");
            drop(streams);
            modules.shutdown().await;
            set_state(ControllerState::Stopped);
            return Ok(());
        }

        // Listeners
        set_state(ControllerState::BindingListeners);
        let mut listeners = ListenerManager::new(notifier.clone());
        let specs: Vec<ListenerSpec> = config.listeners.iter().map(ListenerSpec::from).collect();

        if listeners.bind_all(&specs).await == 0 {
            notifier.error("No service could be started.");
            drop(streams);
            modules.shutdown().await;
            set_state(ControllerState::Stopped);
            return Err(ControllerError::NoListeners);
        }

        // Privileges
        set_state(ControllerState::DroppingPrivileges);
        if let Err(e) = privileges.drop_privileges() {
            listeners.close_all();
            drop(streams);
            modules.shutdown().await;
            set_state(ControllerState::Stopped);
            return Err(e.into());
        }

        if requested(shutdown.as_mut()) {
            set_state(ControllerState::Closing);
            notifier.info("closing ...");
            listeners.close_all();
            drop(streams);
            modules.shutdown().await;
            set_state(ControllerState::Stopped);
            return Ok(());
        }

        addrs_tx.send_replace(listeners.local_addrs().to_vec());
        set_state(ControllerState::Ready);
        notifier.info("Ready for requests.");

        // Running
        let relay = RelayDispatcher::new(registry.clone(), notifier.clone());
        for stream in streams {
            relay.attach(stream);
        }

        let tracker = TaskTracker::new();
        let accept_stop = CancellationToken::new();
        let sessions_stop = CancellationToken::new();

        for listener in listeners.take_listeners() {
            tracker.spawn(accept_loop(
                listener,
                registry.clone(),
                tracker.clone(),
                accept_stop.clone(),
                sessions_stop.clone(),
                notifier.clone(),
            ));
        }

        set_state(ControllerState::Running);
        shutdown.await;

        // Closing
        set_state(ControllerState::Closing);
        notifier.info("closing ...");

        accept_stop.cancel();
        modules.shutdown().await;
        notifier.debug(format!(
            "Draining {} module streams",
            relay.active_streams()
        ));
        relay.drain().await;
        sessions_stop.cancel();
        tracker.close();
        tracker.wait().await;
        listeners.close_all();

        let stats = relay.stats();
        notifier.info(format!(
            "Relayed {} records, {} copies delivered, {} dropped.",
            stats.received, stats.delivered, stats.dropped
        ));

        set_state(ControllerState::Stopped);
        Ok(())
    }
}

/// Whether `shutdown` has already resolved, without waiting for it
fn requested<F: Future<Output = ()>>(shutdown: Pin<&mut F>) -> bool {
    shutdown.now_or_never().is_some()
}

fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenerConfig, PrivilegeConfig};
    use crate::privileges::tests::FakeIdentity;
    use crate::severity::{Notification, Severity};
    use tokio::sync::{mpsc, oneshot};

    fn config(dir: &std::path::Path, ports: &[i64]) -> GpsdTcpConfig {
        let mut config = GpsdTcpConfig::default();
        config.modules.dir = dir.join("modules");
        config.listeners = ports
            .iter()
            .map(|port| ListenerConfig {
                protocol: "IPv4".to_string(),
                address: "127.0.0.1".to_string(),
                port: *port,
            })
            .collect();
        config
    }

    fn free_port() -> i64 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port() as i64
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(note) = rx.try_recv() {
            messages.push(note.message);
        }
        messages
    }

    fn position(messages: &[String], prefix: &str) -> usize {
        messages
            .iter()
            .position(|m| m.starts_with(prefix))
            .unwrap_or_else(|| panic!("no notification starting with {:?}", prefix))
    }

    #[tokio::test]
    async fn test_privileges_dropped_between_bind_and_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[free_port()]);
        config.privileges = PrivilegeConfig {
            user: "nobody".to_string(),
            group: "nogroup".to_string(),
        };

        let fake = FakeIdentity::default();
        let (notifier, mut rx) = Notifier::with_tap(Severity::Information);
        let controller = Controller::new(config, notifier).with_identity_ops(Box::new(fake.clone()));
        let mut state = controller.state();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(controller.run(async move {
            let _ = stop_rx.await;
        }));

        state
            .wait_for(|s| *s == ControllerState::Running)
            .await
            .unwrap();
        stop_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ControllerState::Stopped);

        let messages = drain(&mut rx);
        let listen = position(&messages, "Listen for IPv4");
        let dropped = position(&messages, "Run as user: nobody(65534)");
        let ready = position(&messages, "Ready for requests.");
        assert!(listen < dropped && dropped < ready);
        assert!(fake.calls().iter().any(|c| c == "set_uid 65534"));
    }

    #[tokio::test]
    async fn test_no_listener_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[0, 70000]);
        let (notifier, mut rx) = Notifier::with_tap(Severity::Error);
        let controller = Controller::new(config, notifier);
        let mut state = controller.state();

        let err = controller.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, ControllerError::NoListeners));
        assert_eq!(*state.borrow_and_update(), ControllerState::Stopped);
        assert_eq!(drain(&mut rx), vec!["No service could be started."]);
    }

    #[tokio::test]
    async fn test_privilege_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[free_port()]);
        config.privileges.user = "ghost".to_string();

        let fake = FakeIdentity {
            missing_user: true,
            ..FakeIdentity::default()
        };
        let controller = Controller::new(config, Notifier::new(Severity::Debug))
            .with_identity_ops(Box::new(fake));
        let registry = controller.registry();

        let err = controller.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Privileges(PrivilegeError::UserNotFound(_))
        ));
        assert_eq!(registry.active_count().await, 0);
    }
}
