use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use kestrel_cql::frame::protocol_features::ProtocolFeatures;
use kestrel_cql::frame::protocol_version::ProtocolVersion;
use kestrel_cql::frame::request::query::QueryParameters;
use kestrel_cql::frame::request::{
    options, Execute, Options, Prepare, Query, Register, RequestOpcode, SerializableRequest,
    Startup,
};
use kestrel_cql::frame::response::event::{Event, EventType};
use kestrel_cql::frame::response::error::DbError;
use kestrel_cql::frame::response::result::{self, Prepared};
use kestrel_cql::frame::response::{
    Error as ServerError, NonErrorResponse, Response, ResponseOpcode, Supported,
};
use kestrel_cql::frame::{self, Compression, FrameParams, SerializedRequest};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use super::tls::TlsContext;
use crate::errors::{
    BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError, ConnectionSetupError,
    ConnectionSetupErrorKind, RequestAttemptError,
};
use crate::response::QueryResponse;
use crate::statement::PreparedStatement;

// The term "orphan" refers to stream ids that were allocated for a {request, response} that no
// one is waiting for anymore (the caller dropped the request future). An orphan becomes old
// after `OLD_AGE_ORPHAN_THRESHOLD`; a connection holding more than `OLD_ORPHAN_COUNT_THRESHOLD`
// old orphans is broken, and its pool drops it.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;
const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

// Stream ids are non-negative i16 values; negative ones are reserved for server events.
pub(crate) const MAX_STREAM_IDS: usize = i16::MAX as usize + 1;
const EVENT_STREAM_ID: i16 = -1;

pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a [`Connection`].
///
/// `Closed` is terminal: once there, the connection never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// The TCP connection is being established.
    Connecting = 0,
    /// The TLS handshake is running over the fresh TCP stream.
    TlsHandshake = 1,
    /// OPTIONS/STARTUP are being exchanged in the offered protocol version.
    NegotiatingProtocol = 2,
    /// The connection accepts requests.
    Ready = 3,
    /// Close was requested; pending requests are being failed.
    Closing = 4,
    /// The connection is unusable.
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::TlsHandshake,
            2 => ConnectionState::NegotiatingProtocol,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

// Shared between the connection and its router, which runs as a separate task.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    // Moves to `state` unless already Closed.
    fn set(&self, state: ConnectionState) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Closed as u8).then_some(state as u8)
            });
    }
}

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    features: ProtocolFeatures,
    router_handle: Arc<RouterHandle>,
    state: Arc<StateCell>,
    in_flight: AtomicUsize,
    close_signal: Arc<Notify>,
    reactor_index: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("protocol_version", &self.features.version)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("reactor_index", &self.reactor_index)
            .finish_non_exhaustive()
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request sent by `RouterHandle::send_request` needs a unique request id.
    request_id_generator: AtomicU64,
    // A cancelled `send_request` reports itself here so its stream id can be orphaned.
    // Unbounded, because `Drop` implementations cannot await.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let serialized_request = SerializedRequest::make(request, version, compression, tracing)?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping `notifier` before `disable()` tells the orphaner to orphan
        // the stream id of this request.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError {
                BrokenConnectionErrorKind::ChannelError.into()
            })?;

        let task_response = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        notifier.disable();

        task_response
    }
}

type RequestId = u64;

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestAttemptError>>,
    request_id: RequestId,
}

struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

// Counts a request as in flight for as long as it lives.
struct InFlightGuard<'a> {
    in_flight: &'a AtomicUsize,
    release_notifier: Option<&'a Notify>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(notifier) = self.release_notifier {
            notifier.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) extension_protocol_enabled: bool,
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    /// How long the connection may go without reading anything before it sends
    /// an OPTIONS heartbeat. `None` disables heartbeats.
    pub(crate) heartbeat_interval: Option<Duration>,
    /// How long a heartbeat may go unanswered before the connection is broken.
    pub(crate) idle_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    /// Upper bound on concurrent requests on one connection.
    pub(crate) max_streams: usize,
    pub(crate) tls_context: Option<Arc<dyn TlsContext>>,

    /// Set only on the control connection, which REGISTERs for events.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    /// Woken whenever a request on the connection completes.
    pub(crate) stream_release_notifier: Option<Arc<Notify>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::highest_supported(false),
            extension_protocol_enabled: false,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            max_streams: MAX_STREAM_IDS,
            tls_context: None,
            event_sender: None,
            stream_release_notifier: None,
        }
    }
}

// Used to listen for a fatal error of the connection.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

impl Connection {
    /// Opens the transport (TCP, then TLS if configured) and spawns the router,
    /// but sends no frames yet.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
        reactor_index: usize,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let state = Arc::new(StateCell::new(ConnectionState::Connecting));

        let stream = tokio::time::timeout(
            config.connect_timeout,
            connect_with_source_ip_and_port(connect_address, None, None),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();
        let close_signal = Arc::new(Notify::new());

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
        });

        let router = RouterConfig {
            compression: config.compression,
            max_streams: config.max_streams,
            event_sender: config.event_sender.clone(),
            state: state.clone(),
            close_signal: close_signal.clone(),
            router_handle: router_handle.clone(),
            connect_address,
            version: config.protocol_version,
            heartbeat_interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout,
        };

        let _worker_handle = match &config.tls_context {
            Some(tls_context) => {
                state.set(ConnectionState::TlsHandshake);
                let tls_stream = tokio::time::timeout(
                    config.connect_timeout,
                    tls_context.connect(connect_address, stream),
                )
                .await
                .map_err(|_| ConnectionError::ConnectTimeout)??;
                Self::spawn_router(
                    router,
                    tls_stream,
                    receiver,
                    error_sender,
                    orphan_notification_receiver,
                )
            }
            None => Self::spawn_router(
                router,
                stream,
                receiver,
                error_sender,
                orphan_notification_receiver,
            ),
        };
        state.set(ConnectionState::NegotiatingProtocol);

        let connection = Connection {
            _worker_handle,
            connect_address,
            features: ProtocolFeatures::for_version(config.protocol_version),
            config,
            router_handle,
            state,
            in_flight: AtomicUsize::new(0),
            close_signal,
            reactor_index,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our "interval" is the idle time before probes start, which socket2 calls "time".
        // Its "interval" is the time between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // Same platform constraints as socket2 itself.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    /// Sends a QUERY and waits for its response.
    pub(crate) async fn query(
        &self,
        query: &Query,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        self.send_request(query, true, tracing).await
    }

    /// Prepares `contents` on this connection's node.
    ///
    /// The keyspace goes along only if the protocol version can carry it.
    pub(crate) async fn prepare(
        &self,
        contents: &str,
        keyspace: Option<&str>,
    ) -> Result<PreparedStatement, RequestAttemptError> {
        let keyspace = keyspace
            .filter(|_| self.features.set_keyspace)
            .map(str::to_owned);
        let prepared = self.prepare_raw(contents, keyspace.clone()).await?;
        Ok(PreparedStatement::new(prepared, contents.to_owned(), keyspace))
    }

    async fn prepare_raw(
        &self,
        contents: &str,
        keyspace: Option<String>,
    ) -> Result<Prepared, RequestAttemptError> {
        let prepare = Prepare {
            query: contents.to_owned(),
            keyspace,
        };
        let response = self
            .send_request(&prepare, true, false)
            .await?
            .into_non_error_query_response()?;
        match response.response {
            NonErrorResponse::Result(result::Result::Prepared(prepared)) => Ok(prepared),
            other => Err(RequestAttemptError::UnexpectedResponse(other.opcode())),
        }
    }

    /// Sends an EXECUTE of `prepared` and waits for its response.
    ///
    /// An UNPREPARED answer makes the connection prepare the statement again and
    /// resend the EXECUTE once.
    pub(crate) async fn execute(
        &self,
        prepared: &PreparedStatement,
        parameters: QueryParameters,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute = Execute {
            id: prepared.get_id().clone(),
            result_metadata_id: prepared.get_result_metadata_id(),
            parameters,
        };
        let response = self.send_request(&execute, true, tracing).await?;

        let response = match &response.response {
            Response::Error(ServerError {
                error: DbError::Unprepared { statement_id },
                ..
            }) => {
                debug!(
                    "Node {} lost prepared statement {:?}, repreparing it",
                    self.connect_address, statement_id
                );
                self.reprepare(prepared).await?;
                let execute = Execute {
                    result_metadata_id: prepared.get_result_metadata_id(),
                    ..execute
                };
                self.send_request(&execute, true, tracing).await?
            }
            _ => response,
        };

        if let Response::Result(result::Result::Rows(rows)) = &response.response {
            if let Some(new_metadata_id) = &rows.metadata.new_metadata_id {
                trace!("Result metadata of prepared statement changed");
                prepared.update_result_metadata_id(new_metadata_id.clone());
            }
        }
        Ok(response)
    }

    async fn reprepare(&self, prepared: &PreparedStatement) -> Result<(), RequestAttemptError> {
        let reprepared = self
            .prepare_raw(
                prepared.get_contents(),
                prepared.get_keyspace().map(str::to_owned),
            )
            .await?;

        // The id is a digest of the statement, so it must not change.
        if &reprepared.id != prepared.get_id() {
            return Err(RequestAttemptError::RepreparedIdChanged {
                statement: prepared.get_contents().to_owned(),
                expected_id: prepared.get_id().to_vec(),
                reprepared_id: reprepared.id.to_vec(),
            });
        }
        if let Some(result_metadata_id) = reprepared.result_metadata_id {
            if prepared.get_result_metadata_id().as_ref() != Some(&result_metadata_id) {
                prepared.update_result_metadata_id(result_metadata_id);
            }
        }
        Ok(())
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            release_notifier: self.config.stream_release_notifier.as_deref(),
        };

        let compression = if compress {
            self.config.compression
        } else {
            None
        };

        let task_response = self
            .router_handle
            .send_request(request, self.features.version, compression, tracing)
            .await?;

        Self::parse_response(task_response, self.config.compression)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )
        .map_err(RequestAttemptError::BodyExtensionsParseError)?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(
            task_response.params.version,
            task_response.opcode,
            &mut &*body_with_ext.body,
        )?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    // Sends one of the handshake requests and sorts out version rejections.
    async fn setup_request<R: SerializableRequest>(
        &self,
        request: &R,
    ) -> Result<Response, ConnectionSetupError> {
        let err = |kind: ConnectionSetupErrorKind| ConnectionSetupError::new(R::OPCODE, kind);
        let requested = self.features.version;

        let task_response = self
            .router_handle
            .send_request(request, requested, None, false)
            .await
            .map_err(|e| err(e.into()))?;
        let answered_with = task_response.params.version;

        let response = Self::parse_response(task_response, None)
            .map_err(|e| err(e.into()))?
            .response;

        match response {
            Response::Error(error)
                if error.is_unsupported_protocol_version() || answered_with != requested =>
            {
                Err(err(ConnectionSetupErrorKind::UnsupportedProtocolVersion {
                    requested,
                    reason: error.reason,
                }))
            }
            _ if answered_with != requested => {
                Err(err(ConnectionSetupErrorKind::UnsupportedProtocolVersion {
                    requested,
                    reason: format!("the server answered in protocol version {answered_with}"),
                }))
            }
            Response::Error(ServerError { error, reason }) => {
                Err(err(ConnectionSetupErrorKind::DbError(error, reason)))
            }
            response => Ok(response),
        }
    }

    async fn get_options(&self) -> Result<Supported, ConnectionSetupError> {
        match self.setup_request(&Options).await? {
            Response::Supported(supported) => Ok(supported),
            other => Err(ConnectionSetupError::new(
                RequestOpcode::Options,
                ConnectionSetupErrorKind::UnexpectedResponse(other.opcode()),
            )),
        }
    }

    async fn startup(&self, options: HashMap<String, String>) -> Result<(), ConnectionSetupError> {
        let err = |kind| ConnectionSetupError::new(RequestOpcode::Startup, kind);

        match self.setup_request(&Startup { options }).await? {
            Response::Ready => Ok(()),
            Response::Authenticate(authenticate) => Err(err(
                ConnectionSetupErrorKind::AuthenticationNotSupported(
                    authenticate.authenticator_name,
                ),
            )),
            other => Err(err(ConnectionSetupErrorKind::UnexpectedResponse(
                other.opcode(),
            ))),
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupError> {
        let register_frame = Register {
            event_types_to_register_for,
        };

        match self.setup_request(&register_frame).await? {
            Response::Ready => Ok(()),
            other => Err(ConnectionSetupError::new(
                RequestOpcode::Register,
                ConnectionSetupErrorKind::UnexpectedResponse(other.opcode()),
            )),
        }
    }

    fn spawn_router(
        config: RouterConfig,
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> RemoteHandle<()> {
        let (task, handle) = Self::router(
            config,
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
        )
        .remote_handle();
        tokio::task::spawn(task);
        handle
    }

    async fn router(
        config: RouterConfig,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) {
        let (read_half, write_half) = split(stream);
        // Reader, writer and orphaner run on the same task and never hold the lock
        // across an await, so it is never contended. A RefCell would make the future !Send.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(config.max_streams));
        let last_read = StdMutex::new(Instant::now());

        let h = Self::heartbeater(
            config.router_handle,
            config.version,
            config.heartbeat_interval,
            config.idle_timeout,
            &last_read,
            config.connect_address,
        );
        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &last_read,
            config.event_sender,
            config.compression,
        );
        let w = Self::writer(BufWriter::with_capacity(8192, write_half), &handler_map, receiver);
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);
        let c = async {
            config.close_signal.notified().await;
            Err::<(), BrokenConnectionError>(BrokenConnectionErrorKind::Closed.into())
        };

        let result = futures::try_join!(r, w, o, h, c);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };
        config.state.set(ConnectionState::Closed);
        debug!("Connection router stopped: {}", error);

        // Respond to all pending requests with the error
        let response_handlers = handler_map
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_handlers();

        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        last_read: &StdMutex<Instant>,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameError)?;
            *lock_last_read(last_read) = Instant::now();
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            if params.stream < 0 {
                if params.stream == EVENT_STREAM_ID {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, compression, event_sender).await?;
                    }
                }
                // Other negative streams are reserved and unused.
                continue;
            }

            let handler_lookup_res = lock_handlers(handler_map).lookup(params.stream);

            match handler_lookup_res {
                HandlerLookupResult::Handler(handler) => {
                    // The receiver may have given up waiting; that is fine.
                    let _ = handler.response_sender.send(Ok(response));
                }
                HandlerLookupResult::Missing => {
                    warn!(
                        "Received response with unexpected stream id {}, dropping it",
                        params.stream
                    );
                }
                HandlerLookupResult::Orphaned => {
                    trace!("Dropping late response on orphaned stream {}", params.stream);
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        match lock_handlers(handler_map).allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                debug!("Could not allocate stream id: all streams in use");
                let _ = response_handler
                    .response_sender
                    .send(Err(RequestAttemptError::NoStreamsAvailable));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // Dropping the Connection drops the sender half; the loop then ends.
        while let Some(task) = task_receiver.recv().await {
            let mut next = Some(task);
            let mut num_requests = 0;
            let mut total_sent = 0;

            // Write everything already queued, then flush once.
            while let Some(task) = next.take() {
                if let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler)
                {
                    let mut req = task.serialized_request;
                    req.set_stream(stream_id);
                    let req_data: &[u8] = req.get_data();
                    total_sent += req_data.len();
                    num_requests += 1;
                    write_half
                        .write_all(req_data)
                        .await
                        .map_err(BrokenConnectionErrorKind::WriteError)?;
                }
                next = task_receiver.try_recv().ok();
            }

            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // Receives notifications from `OrphanhoodNotifier`s and orphans stream ids.
    // Breaks the connection once too many orphans got old.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let old_orphan_count = lock_handlers(handler_map).old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(old_orphan_count as u16).into())
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    lock_handlers(handler_map).orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    // Sends OPTIONS once nothing was read for `heartbeat_interval`. An answer that
    // does not come within `idle_timeout` breaks the connection.
    async fn heartbeater(
        router_handle: Arc<RouterHandle>,
        version: ProtocolVersion,
        heartbeat_interval: Option<Duration>,
        idle_timeout: Duration,
        last_read: &StdMutex<Instant>,
        connect_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        let Some(heartbeat_interval) = heartbeat_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.tick().await; // The first tick is instant.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if lock_last_read(last_read).elapsed() < heartbeat_interval {
                continue;
            }

            let heartbeat = router_handle.send_request(&Options, version, None, false);
            match tokio::time::timeout(idle_timeout, heartbeat).await {
                Ok(Ok(_)) => {
                    trace!("Heartbeat answered on connection to {}", connect_address);
                }
                Ok(Err(err)) => {
                    warn!(
                        "Heartbeat failed on connection to {}: {}",
                        connect_address, err
                    );
                    return Err(
                        BrokenConnectionErrorKind::HeartbeatRequestError(Arc::new(err)).into(),
                    );
                }
                Err(_) => {
                    warn!(
                        "No heartbeat response from {} within {:?}, breaking the connection",
                        connect_address, idle_timeout
                    );
                    return Err(BrokenConnectionErrorKind::HeartbeatTimeout(
                        connect_address,
                        idle_timeout,
                    )
                    .into());
                }
            }
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let event = match Self::parse_response(task_response, compression) {
            Ok(QueryResponse {
                response: Response::Event(event),
                ..
            }) => event,
            Ok(other) => {
                error!(
                    "Expected to receive Event response, got {:?}",
                    other.response.opcode()
                );
                return Ok(());
            }
            Err(RequestAttemptError::CqlResponseParseError(e)) => {
                return Err(BrokenConnectionErrorKind::EventParseError(e).into());
            }
            Err(RequestAttemptError::BodyExtensionsParseError(e)) => {
                return Err(BrokenConnectionErrorKind::FrameError(e).into());
            }
            Err(e) => {
                error!("Failed to handle server event: {}", e);
                return Ok(());
            }
        };

        if event_sender.send(event).await.is_err() {
            debug!("Event receiver is gone, dropping server event");
        }
        Ok(())
    }

    pub(crate) fn connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.features.version
    }

    pub(crate) fn features(&self) -> &ProtocolFeatures {
        &self.features
    }

    /// The compression actually used, after falling back to none if the server lacks it.
    pub(crate) fn compression(&self) -> Option<Compression> {
        self.config.compression
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn max_streams(&self) -> usize {
        self.config.max_streams
    }

    pub(crate) fn has_free_stream(&self) -> bool {
        self.in_flight() < self.config.max_streams
    }

    pub(crate) fn reactor_index(&self) -> usize {
        self.reactor_index
    }

    /// Starts closing: pending requests fail with a closed-connection error.
    pub(crate) fn close(&self) {
        if self.state() != ConnectionState::Closed {
            debug!("Closing connection to {}", self.connect_address);
            self.state.set(ConnectionState::Closing);
            self.close_signal.notify_one();
        }
    }
}

fn lock_handlers(map: &StdMutex<ResponseHandlerMap>) -> std::sync::MutexGuard<'_, ResponseHandlerMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_last_read(last_read: &StdMutex<Instant>) -> std::sync::MutexGuard<'_, Instant> {
    last_read.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RouterConfig {
    compression: Option<Compression>,
    max_streams: usize,
    event_sender: Option<mpsc::Sender<Event>>,
    state: Arc<StateCell>,
    close_signal: Arc<Notify>,
    router_handle: Arc<RouterHandle>,
    connect_address: SocketAddr,
    version: ProtocolVersion,
    heartbeat_interval: Option<Duration>,
    idle_timeout: Duration,
}

/// Opens a connection in `config.protocol_version` and sets it up on CQL level:
/// - OPTIONS/STARTUP handshake (CQL version, driver identity, compression);
/// - REGISTER for topology and status events, if this is the control connection.
///
/// A rejected protocol version is reported as an `UnsupportedProtocolVersion`
/// setup error; retrying in a lower version is up to the caller.
pub(crate) async fn open_connection(
    address: SocketAddr,
    config: &ConnectionConfig,
    reactor_index: usize,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    debug!(
        "Opening connection to {} with protocol version {}",
        address, config.protocol_version
    );
    let (mut connection, error_receiver) =
        Connection::new(address, config.clone(), reactor_index).await?;

    let supported = connection.get_options().await?;

    let mut options = HashMap::new();
    options.insert(
        options::CQL_VERSION.to_string(),
        options::DEFAULT_CQL_VERSION.to_string(),
    );
    options.insert(
        options::DRIVER_NAME.to_string(),
        options::DEFAULT_DRIVER_NAME.to_string(),
    );
    options.insert(
        options::DRIVER_VERSION.to_string(),
        options::DEFAULT_DRIVER_VERSION.to_string(),
    );

    if let Some(compression) = config.compression {
        if ProtocolFeatures::supports_compression(&supported.options, compression) {
            options.insert(
                options::COMPRESSION.to_string(),
                compression.as_str().to_string(),
            );
        } else {
            warn!(
                "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                compression
            );
            connection.config.compression = None;
        }
    }

    connection.startup(options).await?;

    if connection.config.event_sender.is_some() {
        connection
            .register(vec![EventType::TopologyChange, EventType::StatusChange])
            .await?;
    }

    connection.state.set(ConnectionState::Ready);
    debug!(
        "Connection to {} ready, protocol version {}",
        address,
        connection.protocol_version()
    );
    Ok((connection, error_receiver))
}

async fn connect_with_source_ip_and_port(
    connect_address: SocketAddr,
    source_ip: Option<IpAddr>,
    source_port: Option<u16>,
) -> Result<TcpStream, std::io::Error> {
    // Binding to port 0 is equivalent to choosing random ephemeral port.
    let source_port = source_port.unwrap_or(0);

    match connect_address {
        SocketAddr::V4(_) => {
            let source_ipv4 = source_ip.unwrap_or(Ipv4Addr::UNSPECIFIED.into());
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::new(source_ipv4, source_port))?;
            Ok(socket.connect(connect_address).await?)
        }
        SocketAddr::V6(_) => {
            let source_ipv6 = source_ip.unwrap_or(Ipv6Addr::UNSPECIFIED.into());
            let socket = TcpSocket::new_v6()?;
            socket.bind(SocketAddr::new(source_ipv6, source_port))?;
            Ok(socket.connect(connect_address).await?)
        }
    }
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some(time) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    // Linear in the number of old orphans only; healthy connections have none.
    fn orphans_older_than(&self, age: Duration) -> usize {
        let minimal_age = Instant::now() - age;
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(max_streams: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(max_streams),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                self.request_to_stream
                    .insert(response_handler.request_id, stream_id);
                self.handlers.insert(stream_id, response_handler);
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    // Orphan the stream id of this request: its handler is freed, but the id stays
    // taken until the response (if any) shows up.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if self.orphanage_tracker.contains(stream_id) {
            self.orphanage_tracker.remove(stream_id);
            self.stream_set.free(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        match self.handlers.remove(&stream_id) {
            Some(handler) => {
                self.stream_set.free(stream_id);
                // Keeps a late orphan notification from touching a reused stream id.
                self.request_to_stream.remove(&handler.request_id);
                HandlerLookupResult::Handler(handler)
            }
            // An unsolicited id must not free a stream some live request owns.
            None => HandlerLookupResult::Missing,
        }
    }

    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// Bitmap of stream ids in use; always hands out the lowest free one.
#[cfg_attr(not(feature = "unstable-testing"), allow(unreachable_pub))]
pub struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    max_streams: usize,
}

#[cfg_attr(not(feature = "unstable-testing"), allow(unreachable_pub))]
impl StreamIdSet {
    /// A set of `max_streams` ids, capped at 32768.
    pub fn new(max_streams: usize) -> Self {
        let max_streams = max_streams.clamp(1, MAX_STREAM_IDS);
        Self {
            used_bitmap: vec![0; max_streams.div_ceil(64)].into_boxed_slice(),
            max_streams,
        }
    }

    /// The lowest free id, or `None` when all of them are in use.
    pub fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                if stream_id >= self.max_streams {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as i16);
            }
        }
        None
    }

    /// Returns `stream_id` to the set. Ids outside the set are ignored.
    pub fn free(&mut self, stream_id: i16) {
        let Ok(stream_id) = usize::try_from(stream_id) else {
            return;
        };
        if let Some(block) = self.used_bitmap.get_mut(stream_id / 64) {
            *block &= !(1u64 << (stream_id % 64));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures::future::join_all;
    use kestrel_cql::frame::protocol_version::ProtocolVersion;
    use kestrel_cql::frame::request::query::{Query, QueryParameters};
    use kestrel_cql::frame::request::Request;
    use kestrel_cql::frame::response::event::{Event, StatusChangeEvent};
    use kestrel_cql::frame::response::result;
    use kestrel_cql::frame::response::Response;
    use kestrel_cql::frame::Compression;
    use kestrel_mock::{
        Condition, MockCluster, MockNode, Reaction, RequestFrame, RequestOpcode, RequestReaction,
        RequestRule, ResponseFrame,
    };
    use tokio::sync::mpsc;

    use super::{open_connection, ConnectionConfig, ConnectionState, StreamIdSet};
    use crate::errors::{
        BrokenConnectionErrorKind, ConnectionError, ConnectionSetupErrorKind, RequestAttemptError,
    };
    use crate::utils::test_utils::setup_tracing;

    fn query(contents: &str) -> Query {
        Query {
            contents: contents.to_owned(),
            parameters: QueryParameters::default(),
        }
    }

    #[test]
    fn stream_ids_are_lowest_free_and_bounded() {
        let mut set = StreamIdSet::new(130);
        let ids: Vec<i16> = (0..130).map(|_| set.allocate().unwrap()).collect();
        assert_eq!(ids, (0..130).collect::<Vec<i16>>());
        assert_eq!(set.allocate(), None);

        set.free(65);
        set.free(3);
        assert_eq!(set.allocate(), Some(3));
        assert_eq!(set.allocate(), Some(65));
        assert_eq!(set.allocate(), None);

        // Out-of-range ids are ignored.
        set.free(-1);
        set.free(i16::MAX);
        assert_eq!(set.allocate(), None);
    }

    #[test]
    fn stream_id_set_is_capped_by_protocol_limit() {
        let mut set = StreamIdSet::new(usize::MAX);
        for expected in 0..=i16::MAX {
            assert_eq!(set.allocate(), Some(expected));
        }
        assert_eq!(set.allocate(), None);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn handshake_makes_connection_ready() {
        setup_tracing();
        let cluster = MockCluster::with_nodes(1).run().await.unwrap();
        let address = cluster.running_nodes[0].address();

        let config = ConnectionConfig {
            compression: Some(Compression::Lz4),
            ..Default::default()
        };
        let (connection, _error_receiver) = open_connection(address, &config, 0).await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(connection.protocol_version(), ProtocolVersion::V4);
        assert_eq!(connection.compression(), Some(Compression::Lz4));
        assert_eq!(connection.connect_address(), address);

        let response = connection.query(&query("SELECT 1"), false).await.unwrap();
        assert_matches!(response.response, Response::Result(result::Result::Void));
        assert_eq!(connection.in_flight(), 0);

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn rejected_version_is_reported() {
        setup_tracing();
        let node = MockNode::builder()
            .max_protocol_version(ProtocolVersion::V3)
            .build();
        let cluster = MockCluster::new([node]).run().await.unwrap();
        let address = cluster.running_nodes[0].address();

        let config = ConnectionConfig {
            protocol_version: ProtocolVersion::V4,
            ..Default::default()
        };
        let err = open_connection(address, &config, 0).await.err().unwrap();
        assert!(err.is_unsupported_protocol_version(), "{err}");

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn authentication_is_refused() {
        setup_tracing();
        let node = MockNode::builder().require_authentication().build();
        let cluster = MockCluster::new([node]).run().await.unwrap();

        let err = open_connection(cluster.running_nodes[0].address(), &Default::default(), 0)
            .await
            .err()
            .unwrap();
        assert_matches!(
            err,
            ConnectionError::ConnectionSetupError(ref e)
                if matches!(e.error, ConnectionSetupErrorKind::AuthenticationNotSupported(_))
        );

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn connect_to_closed_port_fails() {
        setup_tracing();
        // Nothing listens on this address.
        let address = SocketAddr::new(kestrel_mock::get_exclusive_local_address(), 9042);
        let config = ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let err = open_connection(address, &config, 0).await.err().unwrap();
        assert_matches!(
            err,
            ConnectionError::IoError(_) | ConnectionError::ConnectTimeout
        );
    }

    // Sending limit + 1 concurrent requests: `limit` of them occupy distinct streams,
    // the extra one is refused instead of sharing an id.
    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn exceeding_stream_limit_yields_no_streams_available() {
        setup_tracing();
        const LIMIT: usize = 16;

        let hang_queries = RequestRule(
            Condition::RequestOpcode(RequestOpcode::Query),
            RequestReaction::drop_frame(),
        );
        let node = MockNode::builder().request_rules(vec![hang_queries]).build();
        let cluster = MockCluster::new([node]).run().await.unwrap();

        let config = ConnectionConfig {
            max_streams: LIMIT,
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(cluster.running_nodes[0].address(), &config, 0)
                .await
                .unwrap();
        let connection = Arc::new(connection);

        let (done_sender, mut done_receiver) = mpsc::unbounded_channel();
        let mut hanging = Vec::new();
        for i in 0..=LIMIT {
            let connection = connection.clone();
            let done_sender = done_sender.clone();
            hanging.push(tokio::spawn(async move {
                let result = connection.query(&query(&format!("q{i}")), false).await;
                let _ = done_sender.send(result);
            }));
        }

        let refused = done_receiver.recv().await.unwrap();
        assert_matches!(refused, Err(RequestAttemptError::NoStreamsAvailable));
        assert_eq!(connection.in_flight(), LIMIT);
        assert!(!connection.has_free_stream());

        // Closing fails every pending request with a broken-connection error.
        connection.close();
        for _ in 0..LIMIT {
            let result = done_receiver.recv().await.unwrap();
            assert_matches!(
                result,
                Err(RequestAttemptError::BrokenConnectionError(ref e))
                    if matches!(e.kind(), BrokenConnectionErrorKind::Closed)
            );
        }
        join_all(hanging).await;
        assert_eq!(connection.state(), ConnectionState::Closed);

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn dropped_connection_fails_pending_requests() {
        setup_tracing();
        let hang_queries = RequestRule(
            Condition::RequestOpcode(RequestOpcode::Query),
            RequestReaction::drop_connection(),
        );
        let node = MockNode::builder().request_rules(vec![hang_queries]).build();
        let cluster = MockCluster::new([node]).run().await.unwrap();

        let (connection, error_receiver) =
            open_connection(cluster.running_nodes[0].address(), &Default::default(), 0)
                .await
                .unwrap();

        let result = connection.query(&query("SELECT 1"), false).await;
        assert_matches!(result, Err(RequestAttemptError::BrokenConnectionError(_)));
        assert_matches!(error_receiver.await, Ok(ConnectionError::BrokenConnection(_)));
        assert_eq!(connection.state(), ConnectionState::Closed);

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn control_connection_forwards_events() {
        setup_tracing();
        let cluster = MockCluster::with_nodes(1).run().await.unwrap();
        let node = &cluster.running_nodes[0];

        let (event_sender, mut event_receiver) = mpsc::channel(16);
        let config = ConnectionConfig {
            event_sender: Some(event_sender),
            ..Default::default()
        };
        let (_connection, _error_receiver) =
            open_connection(node.address(), &config, 0).await.unwrap();

        let pushed = Event::StatusChange(StatusChangeEvent::Down(node.address()));
        assert_eq!(node.push_event(&pushed), 1);
        assert_eq!(event_receiver.recv().await, Some(pushed));

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn idle_connection_sends_heartbeats() {
        setup_tracing();
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let seen_options = RequestRule(
            Condition::RequestOpcode(RequestOpcode::Options),
            RequestReaction::noop().with_feedback_when_performed(feedback_tx),
        );
        let node = MockNode::builder().request_rules(vec![seen_options]).build();
        let cluster = MockCluster::new([node]).run().await.unwrap();

        let config = ConnectionConfig {
            heartbeat_interval: Some(Duration::from_millis(50)),
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(cluster.running_nodes[0].address(), &config, 0)
                .await
                .unwrap();

        // The handshake OPTIONS, then at least two heartbeats.
        for _ in 0..3 {
            let frame = feedback_rx.recv().await.unwrap();
            assert_eq!(frame.opcode, RequestOpcode::Options);
        }
        assert_eq!(connection.state(), ConnectionState::Ready);

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn unanswered_heartbeat_breaks_the_connection() {
        setup_tracing();
        // The first OPTIONS belongs to the handshake and is answered.
        let swallow_heartbeats = RequestRule(
            Condition::RequestOpcode(RequestOpcode::Options)
                .and(Condition::not(Condition::TrueForLimitedTimes(1))),
            RequestReaction::drop_frame(),
        );
        let node = MockNode::builder()
            .request_rules(vec![swallow_heartbeats])
            .build();
        let cluster = MockCluster::new([node]).run().await.unwrap();

        let config = ConnectionConfig {
            heartbeat_interval: Some(Duration::from_millis(50)),
            idle_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (connection, error_receiver) =
            open_connection(cluster.running_nodes[0].address(), &config, 0)
                .await
                .unwrap();

        let error = error_receiver.await.unwrap();
        let broken = assert_matches!(error, ConnectionError::BrokenConnection(e) => e);
        assert_matches!(
            broken.kind(),
            BrokenConnectionErrorKind::HeartbeatTimeout(_, timeout)
                if *timeout == Duration::from_millis(200)
        );
        assert_eq!(connection.state(), ConnectionState::Closed);

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn forgotten_statement_is_reprepared_on_the_same_connection() {
        setup_tracing();
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let seen_prepares = RequestRule(
            Condition::RequestOpcode(RequestOpcode::Prepare),
            RequestReaction::noop().with_feedback_when_performed(feedback_tx),
        );
        let node = MockNode::builder().request_rules(vec![seen_prepares]).build();
        let cluster = MockCluster::new([node]).run().await.unwrap();
        let node = &cluster.running_nodes[0];
        let config = ConnectionConfig {
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(node.address(), &config, 0).await.unwrap();

        let prepared = connection
            .prepare("SELECT * FROM ks.t WHERE a = ?", Some("ks"))
            .await
            .unwrap();
        assert_eq!(prepared.get_keyspace(), Some("ks"));
        assert!(prepared.get_result_metadata_id().is_some());
        feedback_rx.recv().await.unwrap();

        let response = connection
            .execute(&prepared, QueryParameters::default(), false)
            .await
            .unwrap();
        assert_matches!(response.response, Response::Result(result::Result::Void));
        assert_matches!(feedback_rx.try_recv(), Err(_));

        node.forget_prepared_statements();
        let response = connection
            .execute(&prepared, QueryParameters::default(), false)
            .await
            .unwrap();
        assert_matches!(response.response, Response::Result(result::Result::Void));
        let reprepare = feedback_rx.recv().await.unwrap();
        assert_matches!(
            reprepare.deserialize(),
            Ok(Some(Request::Prepare(prepare)))
                if prepare.query == "SELECT * FROM ks.t WHERE a = ?"
                    && prepare.keyspace.as_deref() == Some("ks")
        );
        assert_eq!(node.prepared_statements_count(), 1);
        assert_eq!(connection.in_flight(), 0);

        cluster.finish().await.unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn reprepare_with_a_different_id_fails() {
        setup_tracing();
        let cluster = MockCluster::with_nodes(1).run().await.unwrap();
        let node = &cluster.running_nodes[0];
        let (connection, _error_receiver) =
            open_connection(node.address(), &Default::default(), 0)
                .await
                .unwrap();

        let prepared = connection
            .prepare("SELECT * FROM ks.t", None)
            .await
            .unwrap();
        // Answer the next PREPARE with an id that does not match.
        node.forget_prepared_statements();
        node.change_request_rules(Some(vec![RequestRule(
            Condition::RequestOpcode(RequestOpcode::Prepare),
            RequestReaction::forge_response(Arc::new(|request: RequestFrame| {
                ResponseFrame::forged_prepared(
                    request.params,
                    result::Prepared {
                        id: Bytes::from_static(b"other"),
                        result_metadata_id: None,
                        prepared_metadata: Default::default(),
                        result_metadata: Default::default(),
                    },
                )
                .unwrap()
            })),
        )]));

        let error = connection
            .execute(&prepared, QueryParameters::default(), false)
            .await
            .unwrap_err();
        assert_matches!(
            error,
            RequestAttemptError::RepreparedIdChanged { ref reprepared_id, .. }
                if reprepared_id.as_slice() == b"other"
        );

        cluster.finish().await.unwrap();
    }
}
