use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use super::connection::{Connection, ConnectionConfig, ErrorReceiver};
use super::protocol_negotiation::open_negotiated_connection;
use super::reactor::ReactorGroup;
use crate::errors::{BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError};

#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    /// Connections opened by `fill()`.
    pub(crate) core_connections: usize,
    /// Upper bound, reached only while every connection is out of streams.
    pub(crate) max_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: Default::default(),
            core_connections: 1,
            max_connections: 2,
        }
    }
}

/// Reported to the owner of the pool when its last connection went away.
#[derive(Debug, Clone)]
pub(crate) struct PoolEmptied {
    pub(crate) address: SocketAddr,
    /// Connection attempts that failed since the last successful one.
    pub(crate) failed_attempts: u32,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    pending_opens: usize,
    last_error: Option<ConnectionError>,
    failed_attempts: u32,
    closed: bool,
}

impl PoolState {
    // Least busy ready connection that still has a free stream.
    fn pick(&self) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| c.is_ready() && c.has_free_stream())
            .min_by_key(|c| c.in_flight())
            .cloned()
    }

    fn total(&self) -> usize {
        self.connections.len() + self.pending_opens
    }
}

struct PoolShared {
    address: SocketAddr,
    config: PoolConfig,
    reactors: Arc<ReactorGroup>,
    state: StdMutex<PoolState>,
    // Woken when a stream is released, a connection is added or removed, or the pool closes.
    changed: Arc<Notify>,
    emptied_sender: Option<mpsc::UnboundedSender<PoolEmptied>>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report_if_emptied(&self, state: &PoolState) {
        if state.closed || state.total() > 0 {
            return;
        }
        if let Some(sender) = &self.emptied_sender {
            let _ = sender.send(PoolEmptied {
                address: self.address,
                failed_attempts: state.failed_attempts,
            });
        }
    }
}

/// The connections of the driver to one node.
///
/// The pool never reconnects on its own: a broken connection is removed and
/// it is up to the owner to call [`fill`](Self::fill) again.
pub(crate) struct NodeConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("NodeConnectionPool")
            .field("address", &self.shared.address)
            .field("connections", &state.connections.len())
            .field("pending_opens", &state.pending_opens)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        address: SocketAddr,
        mut config: PoolConfig,
        reactors: Arc<ReactorGroup>,
        emptied_sender: Option<mpsc::UnboundedSender<PoolEmptied>>,
    ) -> Self {
        let changed = Arc::new(Notify::new());
        config.connection_config.stream_release_notifier = Some(changed.clone());
        config.core_connections = config.core_connections.max(1);
        config.max_connections = config.max_connections.max(config.core_connections);

        NodeConnectionPool {
            shared: Arc::new(PoolShared {
                address,
                config,
                reactors,
                state: StdMutex::new(PoolState::default()),
                changed,
                emptied_sender,
            }),
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.shared.address
    }

    /// Starts opening connections until the pool holds (or is opening) the core number.
    pub(crate) fn fill(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        let missing = self
            .shared
            .config
            .core_connections
            .saturating_sub(state.total());
        for _ in 0..missing {
            start_opening(&self.shared, &mut state);
        }
    }

    /// Hands out a ready connection with a free stream id.
    ///
    /// When every connection is out of streams, opens one more (up to the max),
    /// and otherwise waits for a stream to be released.
    pub(crate) async fn acquire(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(ConnectionPoolError::Closed);
                }
                if let Some(connection) = state.pick() {
                    return Ok(connection);
                }

                if state.total() == 0 {
                    return Err(match &state.last_error {
                        Some(error) => ConnectionPoolError::Broken {
                            last_connection_error: error.clone(),
                        },
                        None => ConnectionPoolError::Initializing,
                    });
                }

                let saturated = state.pending_opens == 0
                    && state.connections.iter().all(|c| !c.has_free_stream());
                if saturated && state.total() < self.shared.config.max_connections {
                    trace!(
                        "All connections to {} are busy, opening another one",
                        self.shared.address
                    );
                    start_opening(&self.shared, &mut state);
                }
            }

            notified.await;
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.shared.lock().connections.iter().any(|c| c.is_ready())
    }

    /// Closes every connection; pending requests on them fail. Later acquires fail too.
    pub(crate) fn close(&self) {
        let connections = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.connections)
        };
        debug!(
            "Closing pool of {} ({} connections)",
            self.shared.address,
            connections.len()
        );
        for connection in &connections {
            connection.close();
        }
        self.shared.changed.notify_waiters();
    }
}

impl Drop for NodeConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

// The caller holds the state lock, so `pending_opens` is consistent with the decision to open.
fn start_opening(shared: &Arc<PoolShared>, state: &mut PoolState) {
    let reactor = shared.reactors.next_reactor();
    let reactor_index = reactor.index();
    let address = shared.address;
    let config = shared.config.connection_config.clone();
    let weak = Arc::downgrade(shared);

    let added = reactor.add(async move {
        let result = open_negotiated_connection(address, &config, reactor_index).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match result {
            Ok((connection, error_receiver)) => {
                let Some(connection) = on_opened(&shared, connection) else {
                    return;
                };
                // The watcher must not keep the pool or the connection alive.
                drop(shared);
                watch_connection(weak, connection, error_receiver).await;
            }
            Err(error) => on_open_failed(&shared, error),
        }
    });

    match added {
        Ok(()) => state.pending_opens += 1,
        Err(error) => {
            warn!("Cannot open connection to {}: {}", address, error);
            state.last_error = Some(error.into());
        }
    }
}

fn on_opened(shared: &PoolShared, connection: Connection) -> Option<Weak<Connection>> {
    let connection = Arc::new(connection);
    let mut state = shared.lock();
    state.pending_opens -= 1;
    if state.closed {
        drop(state);
        connection.close();
        return None;
    }

    debug!(
        "New connection to {} (reactor {}, protocol {})",
        shared.address,
        connection.reactor_index(),
        connection.protocol_version()
    );
    state.failed_attempts = 0;
    state.last_error = None;
    let weak = Arc::downgrade(&connection);
    state.connections.push(connection);
    drop(state);

    shared.changed.notify_waiters();
    Some(weak)
}

fn on_open_failed(shared: &PoolShared, error: ConnectionError) {
    warn!("Failed to open connection to {}: {}", shared.address, error);
    let mut state = shared.lock();
    state.pending_opens -= 1;
    state.failed_attempts = state.failed_attempts.saturating_add(1);
    state.last_error = Some(error);
    shared.report_if_emptied(&state);
    drop(state);

    shared.changed.notify_waiters();
}

async fn watch_connection(
    pool: Weak<PoolShared>,
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) {
    // A dropped sender means the connection itself was dropped.
    let error = error_receiver.await.unwrap_or_else(|_| {
        ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
    });

    let Some(shared) = pool.upgrade() else {
        return;
    };
    let mut state = shared.lock();
    let before = state.connections.len();
    state
        .connections
        .retain(|c| !std::ptr::eq(Arc::as_ptr(c), connection.as_ptr()));
    if state.connections.len() == before {
        return;
    }

    debug!(
        "Connection to {} removed from pool: {}",
        shared.address, error
    );
    state.last_error = Some(error);
    shared.report_if_emptied(&state);
    drop(state);

    shared.changed.notify_waiters();
}
