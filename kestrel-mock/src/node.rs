use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use kestrel_cql::frame::protocol_version::ProtocolVersion;
use kestrel_cql::frame::request::{options, Request};
use kestrel_cql::frame::response::result::Prepared;
use kestrel_cql::frame::response::error::DbError;
use kestrel_cql::frame::response::event::Event;
use kestrel_cql::frame::frame_errors::FrameError;
use kestrel_cql::frame::Compression;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::actions::{EvaluationContext, RequestRule};
use crate::errors::{DoorkeeperError, MockError, WorkerError};
use crate::frame::{self, RequestFrame, RequestOpcode, ResponseFrame};

// Used to notify the user that the cluster finished - this happens when all Senders are dropped.
type FinishWaiter = mpsc::Receiver<()>;
type FinishGuard = mpsc::Sender<()>;

// Used to tell all the workers to stop when the user requests that with [RunningMockCluster::finish()].
type TerminateNotifier = broadcast::Receiver<()>;
type TerminateSignaler = broadcast::Sender<()>;

// Used to tell all workers of a node to drop their connections.
type ConnectionCloseNotifier = broadcast::Receiver<()>;
type ConnectionCloseSignaler = broadcast::Sender<()>;

// Used to gather errors from all workers and propagate them to the user,
// returning the first of them from [RunningMockCluster::finish()].
type ErrorPropagator = mpsc::UnboundedSender<MockError>;
type ErrorSink = mpsc::UnboundedReceiver<MockError>;

/// Statements prepared on a node, keyed by their id.
type PreparedStatements = Arc<Mutex<HashMap<Bytes, String>>>;

/// Connections that sent REGISTER, keyed by connection number.
type EventSubscribers = Arc<Mutex<HashMap<usize, (ProtocolVersion, mpsc::UnboundedSender<ResponseFrame>)>>>;

const AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// A simulated node that speaks just enough CQL for a driver to connect and run queries.
///
/// QUERY and EXECUTE frames are answered with an empty RESULT unless a [RequestRule] says
/// otherwise. PREPARE remembers the statement on the node; EXECUTE of a statement the node
/// does not know is answered with an UNPREPARED error.
pub struct MockNode {
    address: SocketAddr,
    max_protocol_version: ProtocolVersion,
    require_authentication: bool,
    request_rules: Vec<RequestRule>,
}

impl MockNode {
    pub fn new(address: SocketAddr) -> Self {
        Self::builder().address(address).build()
    }

    pub fn builder() -> MockNodeBuilder {
        MockNodeBuilder {
            address: None,
            max_protocol_version: ProtocolVersion::V4,
            require_authentication: false,
            request_rules: Vec::new(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

pub struct MockNodeBuilder {
    address: Option<SocketAddr>,
    max_protocol_version: ProtocolVersion,
    require_authentication: bool,
    request_rules: Vec<RequestRule>,
}

impl MockNodeBuilder {
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Highest version the node accepts; newer frames get a PROTOCOL_ERROR.
    pub fn max_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.max_protocol_version = version;
        self
    }

    /// Answer STARTUP with AUTHENTICATE instead of READY.
    pub fn require_authentication(mut self) -> Self {
        self.require_authentication = true;
        self
    }

    pub fn request_rules(mut self, request_rules: Vec<RequestRule>) -> Self {
        self.request_rules = request_rules;
        self
    }

    pub fn build(self) -> MockNode {
        MockNode {
            address: self
                .address
                .unwrap_or_else(|| SocketAddr::new(get_exclusive_local_address(), 9042)),
            max_protocol_version: self.max_protocol_version,
            require_authentication: self.require_authentication,
            request_rules: self.request_rules,
        }
    }
}

/// A set of [MockNode]s started and stopped together.
pub struct MockCluster {
    nodes: Vec<MockNode>,
}

impl MockCluster {
    pub fn new(nodes: impl IntoIterator<Item = MockNode>) -> Self {
        MockCluster {
            nodes: nodes.into_iter().collect(),
        }
    }

    /// `n` nodes with default settings, each on its own loopback address.
    pub fn with_nodes(n: usize) -> Self {
        Self::new((0..n).map(|_| MockNode::builder().build()))
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(MockNode::address).collect()
    }

    /// Binds all nodes and starts accepting connections.
    pub async fn run(self) -> Result<RunningMockCluster, DoorkeeperError> {
        let (terminate_signaler, _) = broadcast::channel(1);
        let (finish_guard, finish_waiter) = mpsc::channel(1);
        let (error_propagator, error_sink) = mpsc::unbounded_channel();

        let mut running_nodes = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            let running = Doorkeeper::spawn(
                node,
                terminate_signaler.clone(),
                finish_guard.clone(),
                error_propagator.clone(),
            )
            .await?;
            running_nodes.push(running);
        }

        Ok(RunningMockCluster {
            terminate_signaler,
            finish_waiter,
            running_nodes,
            error_sink,
        })
    }
}

/// A handle that can be used to inspect a node or change its rules.
pub struct RunningNode {
    address: SocketAddr,
    request_rules: Arc<Mutex<Vec<RequestRule>>>,
    subscribers: EventSubscribers,
    prepared_statements: PreparedStatements,
    connections_accepted: Arc<AtomicUsize>,
    connections_open: Arc<AtomicUsize>,
    connection_close_signaler: ConnectionCloseSignaler,
}

impl RunningNode {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Replaces the previous request rules with the new ones.
    pub fn change_request_rules(&self, rules: Option<Vec<RequestRule>>) {
        *lock(&self.request_rules) = rules.unwrap_or_default();
    }

    /// Pushes `event` to every connection that sent REGISTER.
    /// Returns how many connections it was delivered to.
    pub fn push_event(&self, event: &Event) -> usize {
        let subscribers = lock(&self.subscribers);
        let mut delivered = 0;
        for (version, tx) in subscribers.values() {
            match ResponseFrame::forged_event(*version, event) {
                Ok(frame) => {
                    if tx.send(frame).is_ok() {
                        delivered += 1;
                    }
                }
                Err(err) => error!("Could not serialize event {:?}: {}", event, err),
            }
        }
        delivered
    }

    /// Forgets every prepared statement, as a restarted node would.
    pub fn forget_prepared_statements(&self) {
        lock(&self.prepared_statements).clear();
    }

    pub fn prepared_statements_count(&self) -> usize {
        lock(&self.prepared_statements).len()
    }

    /// Closes every open connection to this node.
    pub fn drop_connections(&self) {
        let _ = self.connection_close_signaler.send(());
    }

    pub fn connections_accepted(&self) -> usize {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn connections_open(&self) -> usize {
        self.connections_open.load(Ordering::Relaxed)
    }
}

/// A handle that can be used to stop the cluster or change the rules.
pub struct RunningMockCluster {
    terminate_signaler: TerminateSignaler,
    finish_waiter: FinishWaiter,
    pub running_nodes: Vec<RunningNode>,
    error_sink: ErrorSink,
}

impl RunningMockCluster {
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.running_nodes.iter().map(RunningNode::address).collect()
    }

    /// Removes all the rules, so every node answers with its built-in behaviour.
    pub fn turn_off_rules(&mut self) {
        for node in &self.running_nodes {
            node.change_request_rules(None);
        }
    }

    /// Attempts to fetch the first error that has occurred since last check.
    pub fn sanity_check(&mut self) -> Result<(), MockError> {
        match self.error_sink.try_recv() {
            Ok(err) => Err(err),
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => Err(MockError::SanityCheckFailure),
        }
    }

    /// Requests termination of all workers and awaits its completion.
    /// Returns the first error that occurred.
    pub async fn finish(mut self) -> Result<(), MockError> {
        self.terminate_signaler.send(()).map_err(|err| {
            MockError::AwaitFinishFailure(format!("Send error in terminate_signaler: {err} (bug!)"))
        })?;
        info!("Sent finish signal to mock node workers.");

        // Workers spawned after the signal must see a closed channel too.
        std::mem::drop(self.terminate_signaler);

        let _ = self.finish_waiter.recv().await;
        info!("All workers have finished.");

        match self.error_sink.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Listens for driver connections on a node's address and spawns a worker for each.
struct Doorkeeper {
    listener: TcpListener,
    address: SocketAddr,
    shared: Arc<NodeShared>,
    terminate_signaler: TerminateSignaler,
    finish_guard: FinishGuard,
    error_propagator: ErrorPropagator,
    connection_close_signaler: ConnectionCloseSignaler,
}

/// Node state shared by the doorkeeper, its workers and the [RunningNode] handle.
struct NodeShared {
    max_protocol_version: ProtocolVersion,
    require_authentication: bool,
    request_rules: Arc<Mutex<Vec<RequestRule>>>,
    subscribers: EventSubscribers,
    prepared_statements: PreparedStatements,
    connections_accepted: Arc<AtomicUsize>,
    connections_open: Arc<AtomicUsize>,
}

impl Doorkeeper {
    async fn spawn(
        node: MockNode,
        terminate_signaler: TerminateSignaler,
        finish_guard: FinishGuard,
        error_propagator: ErrorPropagator,
    ) -> Result<RunningNode, DoorkeeperError> {
        let listener = TcpListener::bind(node.address)
            .await
            .map_err(|err| DoorkeeperError::Listen(node.address, err))?;
        info!("Spawned a mock node doorkeeper on {}.", node.address);

        let shared = Arc::new(NodeShared {
            max_protocol_version: node.max_protocol_version,
            require_authentication: node.require_authentication,
            request_rules: Arc::new(Mutex::new(node.request_rules)),
            subscribers: Default::default(),
            prepared_statements: Default::default(),
            connections_accepted: Default::default(),
            connections_open: Default::default(),
        });
        let (connection_close_signaler, _) = broadcast::channel::<()>(2);

        let running = RunningNode {
            address: node.address,
            request_rules: shared.request_rules.clone(),
            subscribers: shared.subscribers.clone(),
            prepared_statements: shared.prepared_statements.clone(),
            connections_accepted: shared.connections_accepted.clone(),
            connections_open: shared.connections_open.clone(),
            connection_close_signaler: connection_close_signaler.clone(),
        };

        // Subscribed before the task starts, so a finish() right after run() reaches it.
        let terminate_notifier = terminate_signaler.subscribe();
        let doorkeeper = Doorkeeper {
            listener,
            address: node.address,
            shared,
            terminate_signaler,
            finish_guard,
            error_propagator,
            connection_close_signaler,
        };
        tokio::task::spawn(doorkeeper.run(terminate_notifier));
        Ok(running)
    }

    async fn run(self, mut own_terminate_notifier: TerminateNotifier) {
        let mut connection_no: usize = 0;
        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    match res {
                        Ok((stream, driver_addr)) => {
                            info!(
                                "Connected driver from {} to {}, connection no={}.",
                                driver_addr, self.address, connection_no
                            );
                            self.shared.connections_accepted.fetch_add(1, Ordering::Relaxed);
                            self.spawn_worker(stream, driver_addr, connection_no);
                            connection_no += 1;
                        }
                        Err(err) => {
                            error!("Error in doorkeeper with addr {}: {}", self.address, err);
                            let _ = self.error_propagator.send(
                                DoorkeeperError::DriverConnectionAttempt(self.address, err).into(),
                            );
                            break;
                        }
                    }
                }
                _terminate = own_terminate_notifier.recv() => break
            }
        }
        debug!("Doorkeeper exits: node {}.", self.address);
    }

    fn spawn_worker(&self, stream: TcpStream, driver_addr: SocketAddr, connection_no: usize) {
        if let Err(err) = stream.set_nodelay(true) {
            warn!("Could not set TCP_NODELAY for {}: {}", driver_addr, err);
        }
        let (read_half, write_half) = stream.into_split();
        let (tx_driver, rx_driver) = mpsc::unbounded_channel::<ResponseFrame>();

        let new_worker = || NodeWorker {
            terminate_notifier: self.terminate_signaler.subscribe(),
            finish_guard: self.finish_guard.clone(),
            connection_close_notifier: self.connection_close_signaler.subscribe(),
            error_propagator: self.error_propagator.clone(),
            driver_addr,
            node_addr: self.address,
        };

        self.shared.connections_open.fetch_add(1, Ordering::Relaxed);
        let open_guard = OpenConnectionGuard {
            shared: self.shared.clone(),
            connection_no,
        };

        tokio::task::spawn(new_worker().sender_to_driver(write_half, rx_driver));
        tokio::task::spawn(new_worker().request_processor(
            read_half,
            tx_driver,
            connection_no,
            self.shared.clone(),
            self.connection_close_signaler.clone(),
            open_guard,
        ));
    }
}

/// Unregisters a connection from its node when its request processor exits.
struct OpenConnectionGuard {
    shared: Arc<NodeShared>,
    connection_no: usize,
}

impl Drop for OpenConnectionGuard {
    fn drop(&mut self) {
        lock(&self.shared.subscribers).remove(&self.connection_no);
        self.shared.connections_open.fetch_sub(1, Ordering::Relaxed);
    }
}

struct NodeWorker {
    terminate_notifier: TerminateNotifier,
    finish_guard: FinishGuard,
    connection_close_notifier: ConnectionCloseNotifier,
    error_propagator: ErrorPropagator,
    driver_addr: SocketAddr,
    node_addr: SocketAddr,
}

impl NodeWorker {
    fn exit(self, duty: &'static str) {
        debug!(
            "Worker exits: [driver: {}, node: {}]::{}.",
            self.driver_addr, self.node_addr, duty
        );
        std::mem::drop(self.finish_guard);
    }

    async fn run_until_interrupted<F, Fut>(mut self, worker_name: &'static str, f: F)
    where
        F: FnOnce(SocketAddr, SocketAddr) -> Fut,
        Fut: Future<Output = Result<(), MockError>>,
    {
        let fut = f(self.driver_addr, self.node_addr);

        tokio::select! {
            result = fut => {
                if let Err(err) = result {
                    let _ = self.error_propagator.send(err);
                }
            }
            _ = self.terminate_notifier.recv() => (),
            _ = self.connection_close_notifier.recv() => (),
        }
        self.exit(worker_name);
    }

    async fn sender_to_driver(
        self,
        mut write_half: (impl AsyncWrite + Unpin),
        mut responses_rx: mpsc::UnboundedReceiver<ResponseFrame>,
    ) {
        self.run_until_interrupted("sender_to_driver", |driver_addr, node_addr| async move {
            while let Some(response) = responses_rx.recv().await {
                debug!(
                    "Sending Node ({}) -> Driver ({}) frame. opcode: {:?}.",
                    node_addr, driver_addr, &response.opcode
                );
                if response.write(&mut write_half).await.is_err() {
                    // The driver closing its end is routine.
                    debug!("Driver {} dropped connection", driver_addr);
                    return Ok(());
                }
            }
            Ok(())
        })
        .await;
    }

    async fn request_processor(
        self,
        mut read_half: (impl AsyncRead + Unpin),
        driver_tx: mpsc::UnboundedSender<ResponseFrame>,
        connection_no: usize,
        shared: Arc<NodeShared>,
        connection_close_signaler: ConnectionCloseSignaler,
        open_guard: OpenConnectionGuard,
    ) {
        self.run_until_interrupted("request_processor", |driver_addr, node_addr| async move {
            let _open_guard = open_guard;
            let event_registered_flag = AtomicBool::new(false);
            let mut compression: Option<Compression> = None;

            loop {
                let request = match frame::read_request_frame(&mut read_half, compression).await {
                    Ok(request) => request,
                    Err(FrameError::StdIoError(_) | FrameError::ConnectionClosed(..)) => {
                        debug!("Driver {} disconnected from {}", driver_addr, node_addr);
                        return Ok(());
                    }
                    Err(err) => {
                        warn!("Request reception from {} error: {}", driver_addr, err);
                        return Err(WorkerError::MalformedFrame(driver_addr, err).into());
                    }
                };
                debug!(
                    "Received Driver ({}) -> Node ({}) frame. opcode: {:?}.",
                    driver_addr, node_addr, &request.opcode
                );
                trace!("{:?}", request);

                let ctx = EvaluationContext {
                    connection_seq_no: connection_no,
                    opcode: request.opcode,
                    frame_body: request.body.clone(),
                    connection_has_events: event_registered_flag.load(Ordering::Relaxed),
                };

                let matched = {
                    let mut guard = lock(&shared.request_rules);
                    guard
                        .iter_mut()
                        .enumerate()
                        .find_map(|(i, rule)| rule.0.eval(&ctx).then(|| (i, rule.1.clone())))
                };

                let answer_normally = match matched {
                    None => true,
                    Some((i, reaction)) => {
                        info!(
                            "Applying rule no={} to request ({} -> {}).",
                            i, driver_addr, node_addr
                        );
                        debug!("-> Applied reaction: {:?}", reaction);

                        if let Some(ref tx) = reaction.feedback_channel {
                            tx.send(request.clone()).unwrap_or_else(|err| {
                                warn!("Could not send received request as feedback: {}", err)
                            });
                        }

                        let driver_tx_clone = driver_tx.clone();
                        let request_clone = request.clone();
                        let to_sender_action = reaction.to_sender.clone();
                        let forge_action = async move {
                            if let Some(forge_action) = to_sender_action {
                                if let Some(time) = forge_action.delay {
                                    tokio::time::sleep(time).await;
                                }
                                if let Some(processor) = forge_action.msg_processor {
                                    let _ = driver_tx_clone.send(processor(request_clone));
                                }
                            }
                        };

                        let drop_connection_action = reaction.drop_connection;
                        let connection_close_signaler_clone = connection_close_signaler.clone();
                        let drop_action = async move {
                            if let Some(delay) = drop_connection_action {
                                if let Some(time) = delay {
                                    tokio::time::sleep(time).await;
                                }
                                info!(
                                    "Dropping connections between {} and {} (as requested by a rule)!",
                                    driver_addr, node_addr,
                                );
                                let _ = connection_close_signaler_clone.send(());
                            }
                        };

                        tokio::task::spawn(async {
                            futures::join!(forge_action, drop_action);
                        });

                        reaction.answer_normally
                    }
                };

                if !answer_normally {
                    continue;
                }

                let response = match built_in_response(
                    &request,
                    &shared,
                    connection_no,
                    &driver_tx,
                    &event_registered_flag,
                    &mut compression,
                ) {
                    Ok(response) => response,
                    Err(err) => {
                        return Err(WorkerError::ResponseSerialization(driver_addr, err).into())
                    }
                };
                let _ = driver_tx.send(response);
            }
        })
        .await;
    }
}

/// What a healthy node answers to `request`.
fn built_in_response(
    request: &RequestFrame,
    shared: &NodeShared,
    connection_no: usize,
    driver_tx: &mpsc::UnboundedSender<ResponseFrame>,
    event_registered_flag: &AtomicBool,
    compression: &mut Option<Compression>,
) -> Result<ResponseFrame, std::num::TryFromIntError> {
    let version = request.params.version;
    if !version.is_valid() || version > shared.max_protocol_version {
        let msg = format!(
            "Invalid or unsupported protocol version ({}); highest supported version is {}",
            version.raw(),
            shared.max_protocol_version
        );
        return ResponseFrame::forged_error(request.params, DbError::ProtocolError, Some(&msg));
    }

    match request.opcode {
        RequestOpcode::Options => {
            let mut supported = HashMap::new();
            supported.insert(
                options::CQL_VERSION.to_owned(),
                vec![options::DEFAULT_CQL_VERSION.to_owned()],
            );
            supported.insert(
                options::COMPRESSION.to_owned(),
                vec![
                    Compression::Lz4.as_str().to_owned(),
                    Compression::Snappy.as_str().to_owned(),
                ],
            );
            ResponseFrame::forged_supported(request.params, &supported)
        }
        RequestOpcode::Startup => {
            if let Ok(Some(Request::Startup(startup))) = request.deserialize() {
                *compression = match startup.options.get(options::COMPRESSION).map(String::as_str)
                {
                    Some("lz4") => Some(Compression::Lz4),
                    Some("snappy") => Some(Compression::Snappy),
                    _ => None,
                };
                debug!("Connection no={} set compression to {:?}", connection_no, compression);
            }
            if shared.require_authentication {
                ResponseFrame::forged(
                    request.params,
                    &kestrel_cql::frame::response::Response::Authenticate(
                        kestrel_cql::frame::response::Authenticate {
                            authenticator_name: AUTHENTICATOR.to_owned(),
                        },
                    ),
                )
            } else {
                Ok(ResponseFrame::forged_ready(request.params))
            }
        }
        RequestOpcode::Register => {
            event_registered_flag.store(true, Ordering::Relaxed);
            lock(&shared.subscribers).insert(connection_no, (version, driver_tx.clone()));
            Ok(ResponseFrame::forged_ready(request.params))
        }
        RequestOpcode::Query => Ok(ResponseFrame::forged_void(request.params)),
        RequestOpcode::Prepare => match request.deserialize() {
            Ok(Some(Request::Prepare(prepare))) => {
                let id = prepared_id(&prepare.query);
                lock(&shared.prepared_statements).insert(id.clone(), prepare.query);
                let result_metadata_id = version.supports_result_metadata_id().then(|| id.clone());
                ResponseFrame::forged_prepared(
                    request.params,
                    Prepared {
                        id,
                        result_metadata_id,
                        prepared_metadata: Default::default(),
                        result_metadata: Default::default(),
                    },
                )
            }
            _ => malformed(request),
        },
        RequestOpcode::Execute => match request.deserialize() {
            Ok(Some(Request::Execute(execute))) => {
                if lock(&shared.prepared_statements).contains_key(&execute.id) {
                    Ok(ResponseFrame::forged_void(request.params))
                } else {
                    ResponseFrame::forged_error(
                        request.params,
                        DbError::Unprepared {
                            statement_id: execute.id,
                        },
                        Some("Prepared statement not found"),
                    )
                }
            }
            _ => malformed(request),
        },
        other => ResponseFrame::forged_error(
            request.params,
            DbError::ProtocolError,
            Some(&format!("Mock node does not handle {other} requests")),
        ),
    }
}

fn malformed(request: &RequestFrame) -> Result<ResponseFrame, std::num::TryFromIntError> {
    ResponseFrame::forged_error(
        request.params,
        DbError::ProtocolError,
        Some(&format!("Malformed {} request", request.opcode)),
    )
}

// Same text, same id, like a real node hashing the statement.
fn prepared_id(query: &str) -> Bytes {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    Bytes::copy_from_slice(&hasher.finish().to_be_bytes())
}

// Returns next free IP address for another mock node.
// Useful for concurrent testing.
pub fn get_exclusive_local_address() -> IpAddr {
    // A big enough number reduces possibility of clashes with user-taken addresses:
    static ADDRESS_LOWER_THREE_OCTETS: AtomicU32 = AtomicU32::new(4242);
    let next_addr = ADDRESS_LOWER_THREE_OCTETS.fetch_add(1, Ordering::Relaxed);
    if next_addr > (u32::MAX >> 8) {
        panic!("Loopback address pool for tests depleted");
    }
    let next_addr_bytes = next_addr.to_le_bytes();
    IpAddr::V4(Ipv4Addr::new(
        127,
        next_addr_bytes[2],
        next_addr_bytes[1],
        next_addr_bytes[0],
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use kestrel_cql::frame::request::options::Options;
    use kestrel_cql::frame::request::query::Query;
    use kestrel_cql::frame::request::{Execute, Prepare, Register, SerializableRequest, Startup};
    use kestrel_cql::frame::response::event::{EventType, StatusChangeEvent};
    use kestrel_cql::frame::response::result;
    use kestrel_cql::frame::response::{Response, ResponseOpcode};
    use kestrel_cql::frame::{read_response_frame, SerializedRequest};
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::actions::{Condition, Reaction, RequestReaction};
    use crate::example_db_errors;
    use crate::setup_tracing;

    async fn send(
        conn: &mut TcpStream,
        req: &impl SerializableRequest,
        version: ProtocolVersion,
        stream: i16,
    ) {
        let mut req = SerializedRequest::make(req, version, None, false).unwrap();
        req.set_stream(stream);
        conn.write_all(req.get_data()).await.unwrap();
    }

    async fn recv(conn: &mut TcpStream) -> (i16, Response) {
        let (params, opcode, body) = read_response_frame(conn).await.unwrap();
        (
            params.stream,
            Response::deserialize(params.version, opcode, &mut &body[..]).unwrap(),
        )
    }

    fn query(text: &str) -> Query {
        Query {
            contents: text.to_owned(),
            parameters: Default::default(),
        }
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn handshake_and_default_query_answer() {
        setup_tracing();
        let cluster = MockCluster::with_nodes(1).run().await.unwrap();
        let mut conn = TcpStream::connect(cluster.addresses()[0]).await.unwrap();

        send(&mut conn, &Options, ProtocolVersion::V4, 1).await;
        let (stream, response) = recv(&mut conn).await;
        assert_eq!(stream, 1);
        assert_matches!(response, Response::Supported(s) if s.options.contains_key("COMPRESSION"));

        let startup = Startup {
            options: HashMap::new(),
        };
        send(&mut conn, &startup, ProtocolVersion::V4, 2).await;
        assert_matches!(recv(&mut conn).await, (2, Response::Ready));

        send(&mut conn, &query("SELECT 1"), ProtocolVersion::V4, 3).await;
        assert_matches!(
            recv(&mut conn).await,
            (3, Response::Result(kestrel_cql::frame::response::result::Result::Void))
        );

        assert_eq!(cluster.running_nodes[0].connections_accepted(), 1);
        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn executing_a_forgotten_statement_is_unprepared() {
        setup_tracing();
        let cluster = MockCluster::with_nodes(1).run().await.unwrap();
        let mut conn = TcpStream::connect(cluster.addresses()[0]).await.unwrap();

        let prepare = Prepare {
            query: "SELECT * FROM ks.t WHERE a = ?".to_owned(),
            keyspace: None,
        };
        send(&mut conn, &prepare, ProtocolVersion::V5, 1).await;
        let prepared = assert_matches!(
            recv(&mut conn).await,
            (1, Response::Result(result::Result::Prepared(prepared))) => prepared
        );
        assert_eq!(prepared.result_metadata_id.as_ref(), Some(&prepared.id));
        assert_eq!(cluster.running_nodes[0].prepared_statements_count(), 1);

        let execute = Execute {
            id: prepared.id.clone(),
            result_metadata_id: prepared.result_metadata_id.clone(),
            parameters: Default::default(),
        };
        send(&mut conn, &execute, ProtocolVersion::V5, 2).await;
        assert_matches!(recv(&mut conn).await, (2, Response::Result(result::Result::Void)));

        cluster.running_nodes[0].forget_prepared_statements();
        send(&mut conn, &execute, ProtocolVersion::V5, 3).await;
        let (_, response) = recv(&mut conn).await;
        assert_matches!(
            response,
            Response::Error(e) if e.error == DbError::Unprepared { statement_id: prepared.id.clone() }
        );

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn finish_right_after_run() {
        setup_tracing();
        let cluster = MockCluster::with_nodes(3).run().await.unwrap();
        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn newer_protocol_versions_are_rejected() {
        setup_tracing();
        let node = MockNode::builder()
            .max_protocol_version(ProtocolVersion::V3)
            .build();
        let cluster = MockCluster::new([node]).run().await.unwrap();
        let mut conn = TcpStream::connect(cluster.addresses()[0]).await.unwrap();

        send(&mut conn, &Options, ProtocolVersion::V4, 0).await;
        let (_, response) = recv(&mut conn).await;
        let error = assert_matches!(response, Response::Error(error) => error);
        assert!(error.is_unsupported_protocol_version(), "{error:?}");

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn rules_forge_errors_and_report_feedback() {
        setup_tracing();
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let node = MockNode::builder()
            .request_rules(vec![RequestRule(
                Condition::query_contains("ks.t").and(Condition::TrueForLimitedTimes(1)),
                RequestReaction::forge_with_error(example_db_errors::overloaded())
                    .with_feedback_when_performed(feedback_tx),
            )])
            .build();
        let cluster = MockCluster::new([node]).run().await.unwrap();
        let mut conn = TcpStream::connect(cluster.addresses()[0]).await.unwrap();

        send(&mut conn, &query("SELECT * FROM ks.t"), ProtocolVersion::V4, 7).await;
        let (stream, response) = recv(&mut conn).await;
        assert_eq!(stream, 7);
        assert_matches!(response, Response::Error(e) if e.error == DbError::Overloaded);
        let seen = feedback_rx.recv().await.unwrap();
        assert_eq!(seen.query_contents().as_deref(), Some("SELECT * FROM ks.t"));

        // The rule only fires once.
        send(&mut conn, &query("SELECT * FROM ks.t"), ProtocolVersion::V4, 8).await;
        assert_matches!(recv(&mut conn).await, (8, Response::Result(_)));

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn dropped_frames_get_no_answer() {
        setup_tracing();
        let node = MockNode::builder()
            .request_rules(vec![RequestRule(
                Condition::RequestOpcode(RequestOpcode::Query),
                RequestReaction::drop_frame(),
            )])
            .build();
        let cluster = MockCluster::new([node]).run().await.unwrap();
        let mut conn = TcpStream::connect(cluster.addresses()[0]).await.unwrap();

        send(&mut conn, &query("SELECT 1"), ProtocolVersion::V4, 1).await;
        send(&mut conn, &Options, ProtocolVersion::V4, 2).await;
        let (stream, response) = recv(&mut conn).await;
        assert_eq!(stream, 2);
        assert_eq!(response.opcode(), ResponseOpcode::Supported);

        let nothing = tokio::time::timeout(Duration::from_millis(100), recv(&mut conn)).await;
        assert!(nothing.is_err());

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn events_reach_registered_connections() {
        setup_tracing();
        let cluster = MockCluster::with_nodes(1).run().await.unwrap();
        let mut conn = TcpStream::connect(cluster.addresses()[0]).await.unwrap();

        let register = Register {
            event_types_to_register_for: vec![EventType::StatusChange],
        };
        send(&mut conn, &register, ProtocolVersion::V4, 1).await;
        assert_matches!(recv(&mut conn).await, (1, Response::Ready));

        let down = Event::StatusChange(StatusChangeEvent::Down(cluster.addresses()[0]));
        assert_eq!(cluster.running_nodes[0].push_event(&down), 1);
        let (stream, response) = recv(&mut conn).await;
        assert_eq!(stream, -1);
        assert_eq!(response, Response::Event(down));

        cluster.finish().await.unwrap();
    }
}
