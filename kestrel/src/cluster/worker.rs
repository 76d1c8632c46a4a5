use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, RemoteHandle};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use kestrel_cql::frame::protocol_version::ProtocolVersion;
use kestrel_cql::frame::response::event::{Event, StatusChangeEvent, TopologyChangeEvent};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::node::{Node, NodeInfo, NodeState};
use super::state::ClusterState;
use crate::errors::{BrokenConnectionErrorKind, ConnectionError, ExecutionError, NewSessionError};
use crate::network::{
    open_negotiated_connection, Connection, ConnectionConfig, ErrorReceiver, NodeConnectionPool,
    PoolConfig, PoolEmptied, ReactorGroup,
};
use crate::policies::load_balancing::{LoadBalancingPolicy, NodeDistance};
use crate::policies::reconnection::ReconnectionPolicy;
use crate::routing::locator::ReplicationStrategy;

/// A change of the cluster's topology or of a node's status.
///
/// Events come from the server (through the control connection) or are injected
/// with [Session::handle_topology_event](crate::client::session::Session::handle_topology_event).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TopologyEvent {
    /// The node started accepting requests again.
    Up(SocketAddr),
    /// The node went down. Its pool is kept, but it leaves query plans.
    Down(SocketAddr),
    /// A node joined the cluster.
    Added(NodeInfo),
    /// The node left the cluster. Its pool is closed.
    Removed(SocketAddr),
}

impl TopologyEvent {
    /// Topology and status events map to a topology event; schema changes do not.
    pub(crate) fn from_server_event(event: Event) -> Option<TopologyEvent> {
        match event {
            Event::TopologyChange(TopologyChangeEvent::NewNode(address)) => {
                Some(TopologyEvent::Added(NodeInfo::new(address)))
            }
            Event::TopologyChange(TopologyChangeEvent::RemovedNode(address)) => {
                Some(TopologyEvent::Removed(address))
            }
            Event::StatusChange(StatusChangeEvent::Up(address)) => Some(TopologyEvent::Up(address)),
            Event::StatusChange(StatusChangeEvent::Down(address)) => {
                Some(TopologyEvent::Down(address))
            }
            Event::SchemaChange(_) => None,
        }
    }
}

/// Everything the cluster needs to build its view and keep it up to date.
pub(crate) struct ClusterConfig {
    pub(crate) known_nodes: Vec<NodeInfo>,
    pub(crate) keyspaces: HashMap<String, ReplicationStrategy>,
    pub(crate) pool_config: PoolConfig,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
    /// Load balancing policies of every execution profile; they decide which nodes get a pool.
    pub(crate) load_balancers: Vec<Arc<dyn LoadBalancingPolicy>>,
}

struct TopologyRequest {
    event: TopologyEvent,
    response_chan: oneshot::Sender<()>,
}

/// Cluster manages up to date information and connections to database nodes.
/// All state can be accessed by cloning Arc<ClusterState> in the `state` field
pub(crate) struct Cluster {
    // `ArcSwap<ClusterState>` is wrapped in `Arc` to support sharing cluster state
    // between `Cluster` and `ClusterWorker`
    state: Arc<ArcSwap<ClusterState>>,

    topology_channel: mpsc::UnboundedSender<TopologyRequest>,
    protocol_version: ProtocolVersion,

    // Dropping the handle stops the worker.
    worker_handle: Mutex<Option<RemoteHandle<()>>>,
}

// Works in the background to keep the cluster updated
struct ClusterWorker {
    // Cluster state to keep updated:
    cluster_state: Arc<ArcSwap<ClusterState>>,

    pool_config: PoolConfig,
    reactors: Arc<ReactorGroup>,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    load_balancers: Vec<Arc<dyn LoadBalancingPolicy>>,

    // Channel used to receive events injected through the session
    topology_channel: mpsc::UnboundedReceiver<TopologyRequest>,

    // Channel used to receive server events
    server_events_channel: mpsc::Receiver<Event>,

    // Pools report here when they lose their last connection.
    pool_emptied_receiver: mpsc::UnboundedReceiver<PoolEmptied>,
    // Sender part of that channel to pass to new pools.
    pool_emptied_sender: mpsc::UnboundedSender<PoolEmptied>,
    pending_refills: FuturesUnordered<BoxFuture<'static, SocketAddr>>,

    control_connection: ControlConnection,
}

struct ControlConnection {
    config: ConnectionConfig,
    reactor_index: usize,
    connection: Option<(Connection, ErrorReceiver)>,
    failed_attempts: u32,
    reconnect_at: Option<Pin<Box<tokio::time::Sleep>>>,
}

enum ControlEvent {
    Broken(ConnectionError),
    ReconnectDue,
}

impl ControlConnection {
    // Resolves when the current connection breaks, or when it is time to try reconnecting.
    async fn next_event(&mut self) -> ControlEvent {
        if let Some(sleep) = &mut self.reconnect_at {
            sleep.as_mut().await;
            return ControlEvent::ReconnectDue;
        }
        match &mut self.connection {
            Some((_, error_receiver)) => ControlEvent::Broken(error_receiver.await.unwrap_or_else(
                |_| ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into()),
            )),
            None => futures::future::pending().await,
        }
    }
}

// The policies agree on the closest distance; with no policies every node is local.
fn node_distance(
    load_balancers: &[Arc<dyn LoadBalancingPolicy>],
    node: &Arc<Node>,
    state: &ClusterState,
) -> NodeDistance {
    load_balancers
        .iter()
        .map(|policy| policy.distance(node, state))
        .min()
        .unwrap_or(NodeDistance::Local)
}

fn new_pool(
    address: SocketAddr,
    pool_config: &PoolConfig,
    reactors: &Arc<ReactorGroup>,
    pool_emptied_sender: &mpsc::UnboundedSender<PoolEmptied>,
) -> NodeConnectionPool {
    let pool = NodeConnectionPool::new(
        address,
        pool_config.clone(),
        reactors.clone(),
        Some(pool_emptied_sender.clone()),
    );
    pool.fill();
    pool
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.state.load().get_nodes_info().len())
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub(crate) async fn new(
        config: ClusterConfig,
        reactors: Arc<ReactorGroup>,
    ) -> Result<Cluster, NewSessionError> {
        let ClusterConfig {
            known_nodes,
            keyspaces,
            mut pool_config,
            reconnection_policy,
            load_balancers,
        } = config;
        if known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let (topology_sender, topology_receiver) = mpsc::unbounded_channel();
        let (server_events_sender, server_events_receiver) = mpsc::channel(32);
        // Unbounded, so that pools never block or lose a report when many nodes go away at once.
        let (pool_emptied_sender, pool_emptied_receiver) = mpsc::unbounded_channel();

        let control_config = ConnectionConfig {
            event_sender: Some(server_events_sender),
            ..pool_config.connection_config.clone()
        };
        let addresses: Vec<_> = known_nodes.iter().map(|node| node.address).collect();
        let (connection, error_receiver) =
            Self::open_control_connection(&addresses, &control_config, &reactors).await?;

        // Pools start from the version the control connection settled on.
        let protocol_version = connection.protocol_version();
        pool_config.connection_config.protocol_version = protocol_version;
        info!(
            "Control connection to {} established with protocol version {}",
            connection.connect_address(),
            protocol_version
        );

        // Policies are initialised with the nodes before deciding which of them get a pool.
        let unpooled: Vec<_> = known_nodes
            .into_iter()
            .map(|info| Arc::new(Node::new(Uuid::new_v4(), info, NodeState::Up, None)))
            .collect();
        let initial_state = Arc::new(ClusterState::new(unpooled, keyspaces.clone()));
        // Policies may start timers in `init`, so it runs on a reactor.
        let control_reactor = connection.reactor_index();
        let init_policies = load_balancers.clone();
        let init_state = initial_state.clone();
        reactors
            .get(control_reactor)
            .unwrap_or_else(|| reactors.next_reactor())
            .spawn(async move {
                for policy in &init_policies {
                    policy.init(&init_state);
                }
            })
            .await?;

        let nodes = initial_state
            .get_nodes_info()
            .iter()
            .map(|node| {
                let pool = match node_distance(&load_balancers, node, &initial_state) {
                    NodeDistance::Ignored => {
                        debug!("Node {} is ignored by every policy, not connecting", node.address);
                        None
                    }
                    NodeDistance::Local | NodeDistance::Remote => Some(new_pool(
                        node.address,
                        &pool_config,
                        &reactors,
                        &pool_emptied_sender,
                    )),
                };
                let info = NodeInfo {
                    address: node.address,
                    datacenter: node.datacenter.clone(),
                    rack: node.rack.clone(),
                    tokens: node.tokens.clone(),
                };
                Arc::new(Node::new(node.host_id, info, NodeState::Up, pool))
            })
            .collect();
        let cluster_state = Arc::new(ArcSwap::from_pointee(ClusterState::new(nodes, keyspaces)));

        let worker = ClusterWorker {
            cluster_state: cluster_state.clone(),
            pool_config,
            reactors: reactors.clone(),
            reconnection_policy,
            load_balancers,
            topology_channel: topology_receiver,
            server_events_channel: server_events_receiver,
            pool_emptied_receiver,
            pool_emptied_sender,
            pending_refills: FuturesUnordered::new(),
            control_connection: ControlConnection {
                config: control_config,
                reactor_index: control_reactor,
                connection: Some((connection, error_receiver)),
                failed_attempts: 0,
                reconnect_at: None,
            },
        };

        // The worker lives on the same reactor as the control connection.
        let (fut, worker_handle) = worker.work().remote_handle();
        match reactors.get(control_reactor) {
            Some(reactor) => reactor.add(fut)?,
            None => {
                reactors.add(fut)?;
            }
        }

        Ok(Cluster {
            state: cluster_state,
            topology_channel: topology_sender,
            protocol_version,
            worker_handle: Mutex::new(Some(worker_handle)),
        })
    }

    // Tries the known nodes in order; the first one that accepts becomes the control node.
    async fn open_control_connection(
        addresses: &[SocketAddr],
        config: &ConnectionConfig,
        reactors: &ReactorGroup,
    ) -> Result<(Connection, ErrorReceiver), NewSessionError> {
        let mut last_error = None;
        for &address in addresses {
            let reactor = reactors.next_reactor();
            let reactor_index = reactor.index();
            let config = config.clone();
            let opened = reactor
                .spawn(async move { open_negotiated_connection(address, &config, reactor_index).await })
                .await?;
            match opened {
                Ok(opened) => return Ok(opened),
                Err(error) => {
                    warn!("Could not open control connection to {}: {}", address, error);
                    last_error = Some(error);
                }
            }
        }
        Err(match last_error {
            Some(error) => NewSessionError::FailedToConnect(error),
            None => NewSessionError::EmptyKnownNodesList,
        })
    }

    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    /// The protocol version the control connection negotiated.
    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Applies the event and waits until the cluster view reflects it.
    pub(crate) async fn handle_topology_event(
        &self,
        event: TopologyEvent,
    ) -> Result<(), ExecutionError> {
        let (response_sender, response_receiver) = oneshot::channel();
        self.topology_channel
            .send(TopologyRequest {
                event,
                response_chan: response_sender,
            })
            .map_err(|_| ExecutionError::SessionClosed)?;
        response_receiver
            .await
            .map_err(|_| ExecutionError::SessionClosed)
    }

    /// Stops the worker and closes every pool.
    pub(crate) fn close(&self) {
        let worker_handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(worker_handle);

        for node in self.state.load().get_nodes_info() {
            if let Some(pool) = node.pool() {
                pool.close();
            }
        }
    }
}

impl ClusterWorker {
    async fn work(mut self) {
        loop {
            tokio::select! {
                maybe_request = self.topology_channel.recv() => {
                    match maybe_request {
                        Some(request) => {
                            self.apply(request.event);
                            // Nobody may be waiting anymore.
                            let _ = request.response_chan.send(());
                        }
                        None => return, // The cluster was dropped, we can stop working
                    }
                }

                Some(event) = self.server_events_channel.recv() => {
                    debug!("Received server event: {:?}", event);
                    if let Some(event) = TopologyEvent::from_server_event(event) {
                        self.apply(event);
                    }
                }

                Some(emptied) = self.pool_emptied_receiver.recv() => {
                    self.schedule_refill(emptied);
                }

                Some(address) = self.pending_refills.next() => {
                    self.refill(address);
                }

                control_event = self.control_connection.next_event() => match control_event {
                    ControlEvent::Broken(error) => {
                        warn!("Control connection broken: {}", error);
                        self.control_connection.connection = None;
                        self.schedule_control_reconnect();
                    }
                    ControlEvent::ReconnectDue => {
                        self.control_connection.reconnect_at = None;
                        self.reconnect_control_connection().await;
                    }
                },
            }
        }
    }

    fn update_cluster_state(&self, new_cluster_state: ClusterState) {
        self.cluster_state.store(Arc::new(new_cluster_state));
    }

    fn apply(&mut self, event: TopologyEvent) {
        debug!("Applying topology event: {:?}", event);
        let state = self.cluster_state.load_full();
        match event {
            TopologyEvent::Up(address) => {
                let Some(node) = state.get_node(address) else {
                    debug!("Up event for unknown node {}, ignoring", address);
                    return;
                };
                let previous = node.set_state(NodeState::Up);
                if previous != NodeState::Up {
                    info!("Node {} is up", address);
                }
                if let Some(pool) = node.pool() {
                    if !pool.is_connected() {
                        pool.fill();
                    }
                }
            }
            TopologyEvent::Down(address) => {
                if let Some(node) = state.get_node(address) {
                    if node.set_state(NodeState::Down) != NodeState::Down {
                        info!("Node {} is down", address);
                    }
                }
            }
            TopologyEvent::Added(info) => {
                if state.get_node(info.address).is_some() {
                    debug!("Node {} is already known", info.address);
                    return;
                }
                let address = info.address;
                let unpooled = Arc::new(Node::new(Uuid::new_v4(), info.clone(), NodeState::Up, None));
                let distance = node_distance(
                    &self.load_balancers,
                    &unpooled,
                    &state.with_added_node(unpooled.clone()),
                );
                let pool = (distance != NodeDistance::Ignored).then(|| {
                    new_pool(
                        address,
                        &self.pool_config,
                        &self.reactors,
                        &self.pool_emptied_sender,
                    )
                });
                let node = Arc::new(Node::new(unpooled.host_id, info, NodeState::Up, pool));
                info!("Node {} added ({:?})", address, distance);
                self.update_cluster_state(state.with_added_node(node));
            }
            TopologyEvent::Removed(address) => {
                let Some(node) = state.get_node(address) else {
                    debug!("Removal of unknown node {}, ignoring", address);
                    return;
                };
                node.set_state(NodeState::Removed);
                if let Some(pool) = node.pool() {
                    pool.close();
                }
                info!("Node {} removed", address);
                self.update_cluster_state(state.without_node(address));
            }
        }
    }

    fn schedule_refill(&mut self, emptied: PoolEmptied) {
        let state = self.cluster_state.load();
        let Some(node) = state.get_node(emptied.address) else {
            return;
        };
        if !node.is_up() {
            debug!("Pool of {} is empty, but the node is not up", emptied.address);
            return;
        }
        let delay = self.reconnection_policy.delay(emptied.failed_attempts);
        debug!(
            "Pool of {} is empty, refilling in {:?} (after {} failed attempts)",
            emptied.address, delay, emptied.failed_attempts
        );
        let address = emptied.address;
        self.pending_refills
            .push(tokio::time::sleep(delay).map(move |()| address).boxed());
    }

    fn refill(&self, address: SocketAddr) {
        let state = self.cluster_state.load();
        match state.get_node(address) {
            Some(node) if node.is_up() => {
                if let Some(pool) = node.pool() {
                    pool.fill();
                }
            }
            _ => debug!("Skipping refill of {}, the node is gone or down", address),
        }
    }

    fn schedule_control_reconnect(&mut self) {
        let delay = self
            .reconnection_policy
            .delay(self.control_connection.failed_attempts);
        debug!("Reopening the control connection in {:?}", delay);
        self.control_connection.reconnect_at = Some(Box::pin(tokio::time::sleep(delay)));
    }

    async fn reconnect_control_connection(&mut self) {
        let state = self.cluster_state.load_full();
        let control = &mut self.control_connection;
        for node in state.get_nodes_info().iter().filter(|node| node.is_up()) {
            match open_negotiated_connection(node.address, &control.config, control.reactor_index)
                .await
            {
                Ok(opened) => {
                    info!("Control connection reopened to {}", node.address);
                    control.connection = Some(opened);
                    control.failed_attempts = 0;
                    return;
                }
                Err(error) => {
                    debug!("Could not reopen control connection to {}: {}", node.address, error)
                }
            }
        }
        control.failed_attempts = control.failed_attempts.saturating_add(1);
        self.schedule_control_reconnect();
    }
}
