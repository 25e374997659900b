//! Listener management
//!
//! Validates the configured address/port pairs and binds one TCP listener per
//! valid pair. Invalid or unbindable entries are reported and skipped; only an
//! empty result is a problem, and that is for the controller to decide.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::config::ListenerConfig;
use crate::severity::Notifier;

/// Listener errors
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Port number {port} are invalid. {spec} will be ignored.")]
    InvalidPort { port: i64, spec: String },

    #[error("Address {address} is invalid. {spec} will be ignored.")]
    InvalidAddress { address: String, spec: String },

    #[error("Can't start {spec}.\n{source}")]
    Bind {
        spec: String,
        #[source]
        source: io::Error,
    },
}

/// A requested listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    /// Label for log output
    pub protocol: String,
    pub address: String,
    pub port: i64,
}

impl ListenerSpec {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>, port: i64) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
            port,
        }
    }

    /// Check the port range (1-65535) and parse the address
    pub fn validate(&self) -> Result<SocketAddr, ListenerError> {
        let port = u16::try_from(self.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ListenerError::InvalidPort {
                port: self.port,
                spec: self.to_string(),
            })?;

        let address = self.address.trim();
        let address = address
            .strip_prefix('[')
            .and_then(|a| a.strip_suffix(']'))
            .unwrap_or(address);
        let ip: IpAddr = address
            .parse()
            .map_err(|_| ListenerError::InvalidAddress {
                address: self.address.clone(),
                spec: self.to_string(),
            })?;

        Ok(SocketAddr::new(ip, port))
    }
}

impl From<&ListenerConfig> for ListenerSpec {
    fn from(config: &ListenerConfig) -> Self {
        Self::new(&config.protocol, &config.address, config.port)
    }
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listener for {} port {}",
            self.protocol, self.address, self.port
        )
    }
}

/// Listener lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Bind attempted
    Created,
    /// Bound and accepting
    Active,
    /// Bind failed
    Failed(String),
    /// Shut down
    Closed,
}

/// A bound, accepting endpoint
#[derive(Debug)]
pub struct Listener {
    spec: ListenerSpec,
    local_addr: SocketAddr,
    socket: TcpListener,
}

impl Listener {
    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    /// Actual bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.socket.accept().await
    }
}

/// Binds and owns the configured listeners
pub struct ListenerManager {
    /// Active listeners not yet handed to accept loops
    listeners: Vec<Listener>,
    /// Outcome per bind attempt, in order
    states: Vec<(ListenerSpec, ListenerState)>,
    local_addrs: Vec<SocketAddr>,
    notifier: Notifier,
}

impl ListenerManager {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            listeners: Vec::new(),
            states: Vec::new(),
            local_addrs: Vec::new(),
            notifier,
        }
    }

    /// Validate and bind every spec, in order
    ///
    /// Never stops early. Returns the number of listeners that became active.
    pub async fn bind_all(&mut self, specs: &[ListenerSpec]) -> usize {
        for spec in specs {
            let addr = match spec.validate() {
                Ok(addr) => addr,
                Err(e) => {
                    self.notifier.warning(e.to_string());
                    continue;
                }
            };

            self.notifier.info(format!(
                "Create {} for address {} on port {}",
                spec.protocol, spec.address, spec.port
            ));
            self.states.push((spec.clone(), ListenerState::Created));

            match self.bind(spec, addr).await {
                Ok(listener) => {
                    self.notifier.info(format!(
                        "Listen for {} on {} port {}",
                        spec.protocol,
                        listener.local_addr.ip(),
                        listener.local_addr.port()
                    ));
                    self.set_last_state(ListenerState::Active);
                    self.local_addrs.push(listener.local_addr);
                    self.listeners.push(listener);
                }
                Err(e) => {
                    self.notifier.error(e.to_string());
                    self.set_last_state(ListenerState::Failed(e.to_string()));
                }
            }
        }

        self.active_count()
    }

    async fn bind(&self, spec: &ListenerSpec, addr: SocketAddr) -> Result<Listener, ListenerError> {
        let bind_error = |source| ListenerError::Bind {
            spec: spec.to_string(),
            source,
        };
        let socket = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;
        Ok(Listener {
            spec: spec.clone(),
            local_addr,
            socket,
        })
    }

    fn set_last_state(&mut self, state: ListenerState) {
        if let Some(last) = self.states.last_mut() {
            last.1 = state;
        }
    }

    /// Number of listeners that bound successfully
    pub fn active_count(&self) -> usize {
        self.states
            .iter()
            .filter(|(_, state)| *state == ListenerState::Active)
            .count()
    }

    /// Bound addresses of all active listeners
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn states(&self) -> &[(ListenerSpec, ListenerState)] {
        &self.states
    }

    /// Hand the bound listeners over to the accept loops
    pub fn take_listeners(&mut self) -> Vec<Listener> {
        std::mem::take(&mut self.listeners)
    }

    /// Mark every active listener closed
    pub fn close_all(&mut self) {
        self.listeners.clear();
        for (spec, state) in self.states.iter_mut() {
            if *state == ListenerState::Active {
                self.notifier.debug(format!("Closed {}", spec));
                *state = ListenerState::Closed;
            }
        }
    }
}
