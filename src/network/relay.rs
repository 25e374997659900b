//! Record relay
//!
//! Fans module records out to every active client session. Each module gets
//! one relay task; a record is offered to each session's bounded queue without
//! waiting, so a slow client only loses its own copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::task::TaskTracker;

use crate::module::traits::{ModuleStream, Record};
use crate::network::session::ClientRegistry;
use crate::severity::{Notifier, Severity};

/// Relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    /// Records received from modules
    pub received: u64,
    /// Copies queued to sessions
    pub delivered: u64,
    /// Copies dropped because a session queue was full
    pub dropped: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out engine from modules to client sessions
#[derive(Clone)]
pub struct RelayDispatcher {
    registry: ClientRegistry,
    tracker: TaskTracker,
    stats: Arc<RelayStats>,
    notifier: Notifier,
}

impl RelayDispatcher {
    pub fn new(registry: ClientRegistry, notifier: Notifier) -> Self {
        Self {
            registry,
            tracker: TaskTracker::new(),
            stats: Arc::new(RelayStats::default()),
            notifier,
        }
    }

    /// Start relaying a module's records
    ///
    /// The relay task ends when the module's stream ends.
    pub fn attach(&self, stream: ModuleStream) {
        let relay = self.clone();
        self.tracker.spawn(async move {
            let ModuleStream { name, mut records } = stream;
            while let Some(record) = records.recv().await {
                relay.dispatch(&name, &record).await;
            }
            relay
                .notifier
                .debug(format!("Module {} stream ended", name));
        });
    }

    /// Offer one record to every active session
    ///
    /// Returns how many sessions the record was queued for.
    pub async fn dispatch(&self, module: &str, record: &Record) -> usize {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        if self.notifier.enabled(Severity::Debug) {
            self.notifier
                .debug(format!("Recived data from module: {}", module));
        }

        let sessions = self.registry.read().await;
        let mut delivered = 0;

        for entry in sessions.values() {
            match entry.queue.try_send(record.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    self.notifier.warning(format!(
                        "Client {} is not keeping up, data from module {} dropped.",
                        entry.session.remote_addr, module
                    ));
                }
                // Session is tearing down
                Err(TrySendError::Closed(_)) => {}
            }
        }

        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Wait until every attached stream has ended and been relayed
    ///
    /// No further streams can be attached afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Number of relay tasks still running
    pub fn active_streams(&self) -> usize {
        self.tracker.len()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}
