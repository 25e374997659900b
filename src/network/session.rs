//! Client sessions
//!
//! The [`ClientRegistry`] holds the live session set. Accept loops add
//! sessions, session tasks remove them when the connection ends, and the relay
//! reads the set to deliver records.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::module::traits::Record;
use crate::network::listener::Listener;
use crate::severity::Notifier;
use crate::utils::time::current_timestamp;

/// Upper bound for writing out queued records once shutdown starts
pub const SESSION_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub type SessionId = u64;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not yet visible to the relay
    Connected,
    /// Registered, receives records
    Active,
    /// Removed from the registry
    Disconnected,
}

/// One accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    /// Unix timestamp of the accept
    pub attached_at: u64,
    pub state: SessionState,
}

pub(crate) struct SessionEntry {
    pub(crate) session: ClientSession,
    pub(crate) queue: mpsc::Sender<Record>,
}

/// Live set of client sessions
#[derive(Clone)]
pub struct ClientRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    next_id: Arc<AtomicU64>,
    /// Records buffered per session
    session_queue: usize,
}

impl ClientRegistry {
    pub fn new(session_queue: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            session_queue: session_queue.max(1),
        }
    }

    /// Add a session to the live set
    ///
    /// The returned receiver yields the records relayed to this session.
    pub async fn register(&self, remote_addr: SocketAddr) -> (ClientSession, mpsc::Receiver<Record>) {
        let mut session = ClientSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            attached_at: current_timestamp(),
            state: SessionState::Connected,
        };
        let (queue, records) = mpsc::channel(self.session_queue);

        let mut sessions = self.sessions.write().await;
        session.state = SessionState::Active;
        sessions.insert(
            session.id,
            SessionEntry {
                session: session.clone(),
                queue,
            },
        );

        (session, records)
    }

    /// Remove a session from the live set
    ///
    /// Once this returns, the relay no longer delivers to the session.
    pub async fn deregister(&self, id: SessionId) -> Option<ClientSession> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id).map(|entry| {
            let mut session = entry.session;
            session.state = SessionState::Disconnected;
            session
        })
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remote addresses of all live sessions, oldest first
    pub async fn addresses(&self) -> Vec<SocketAddr> {
        self.sessions().await.into_iter().map(|s| s.remote_addr).collect()
    }

    /// Snapshot of all live sessions, oldest first
    pub async fn sessions(&self) -> Vec<ClientSession> {
        let sessions = self.sessions.read().await;
        let mut live: Vec<ClientSession> = sessions.values().map(|e| e.session.clone()).collect();
        live.sort_by_key(|s| s.id);
        live
    }

    /// Read access for delivery; removals wait until the guard is dropped
    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.read().await
    }
}

/// Accept connections on `listener` until `stop` is cancelled
///
/// Every accepted connection gets its own session task on `tracker`; session
/// tasks end when `sessions_stop` is cancelled.
pub async fn accept_loop(
    listener: Listener,
    registry: ClientRegistry,
    tracker: TaskTracker,
    stop: CancellationToken,
    sessions_stop: CancellationToken,
    notifier: Notifier,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote_addr)) => {
                notifier.info(format!("Connection from {}.", remote_addr));
                let (session, records) = registry.register(remote_addr).await;
                tracker.spawn(run_session(
                    stream,
                    session,
                    records,
                    registry.clone(),
                    sessions_stop.clone(),
                    notifier.clone(),
                ));
            }
            Err(e) => {
                notifier.warning(format!(
                    "Can't accept connection on {}.\n{}",
                    listener.local_addr(),
                    e
                ));
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }

    notifier.debug(format!(
        "Stopped accepting for {} on {}",
        listener.spec(),
        listener.local_addr()
    ));
}

/// Serve one client until it disconnects or `stop` is cancelled
///
/// Relayed records are written in queue order. Client input is read and
/// discarded so that a closed connection is noticed.
pub async fn run_session(
    stream: TcpStream,
    session: ClientSession,
    mut records: mpsc::Receiver<Record>,
    registry: ClientRegistry,
    stop: CancellationToken,
    notifier: Notifier,
) {
    let remote_addr = session.remote_addr;
    let (mut reader, mut writer) = stream.into_split();
    let mut discard = [0u8; 512];

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                flush(&mut writer, &mut records, &remote_addr, &notifier).await;
                break;
            }
            record = records.recv() => {
                let Some(record) = record else { break };
                let written = tokio::select! {
                    biased;
                    written = writer.write_all(&record) => written,
                    _ = stop.cancelled() => break,
                };
                match written {
                    Ok(()) => notifier.debug(format!("Sent to client {}", remote_addr)),
                    Err(e) => {
                        notifier.debug(format!("Can't write to client {}: {}", remote_addr, e));
                        break;
                    }
                }
            }
            read = reader.read(&mut discard) => match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    notifier.debug(format!("Can't read from client {}: {}", remote_addr, e));
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    registry.deregister(session.id).await;
    notifier.info(format!("Connection from {} closed.", remote_addr));
}

/// Write out whatever is already queued, bounded by [`SESSION_FLUSH_TIMEOUT`]
async fn flush(
    writer: &mut OwnedWriteHalf,
    records: &mut mpsc::Receiver<Record>,
    remote_addr: &SocketAddr,
    notifier: &Notifier,
) {
    let drained = tokio::time::timeout(SESSION_FLUSH_TIMEOUT, async {
        while let Ok(record) = records.try_recv() {
            writer.write_all(&record).await?;
            notifier.debug(format!("Sent to client {}", remote_addr));
        }
        writer.flush().await
    })
    .await;

    match drained {
        Ok(Ok(())) => {}
        Ok(Err(e)) => notifier.debug(format!("Can't write to client {}: {}", remote_addr, e)),
        Err(_) => notifier.debug(format!("Gave up flushing client {}", remote_addr)),
    }
}
