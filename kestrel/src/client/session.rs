//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to execute CQL requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_cql::frame::protocol_version::ProtocolVersion;
use kestrel_cql::frame::Compression;
use tracing::{debug, info, warn};

use super::execution::{PrepareExecution, RequestExecution};
use super::execution_profile::{ExecutionProfile, ExecutionProfileHandle, ResolvedProfile};
use super::result_future::ResultFuture;
use crate::cluster::{Cluster, ClusterConfig, ClusterState, NodeInfo, TopologyEvent};
use crate::errors::{ExecutionError, NewSessionError, ProfileError, ReactorError};
use crate::network::{
    ConnectionConfig, PoolConfig, ReactorGroup, TlsContext, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_IDLE_TIMEOUT, MAX_STREAM_IDS,
};
use crate::policies::reconnection::{ConstantReconnectionPolicy, ReconnectionPolicy};
use crate::routing::locator::ReplicationStrategy;
use crate::statement::{ProfileSelector, Statement};

/// How [`SessionConfig::new_instance`] copies execution profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileCopyMode {
    /// The copy refers to the same policy objects as the original.
    #[default]
    Shared,
    /// Load balancing policies that support it are recreated, so that the copy
    /// keeps its own routing state. Retry and speculative execution policies are
    /// stateless and stay shared.
    Deep,
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SessionConfig {
    /// List of database servers known on Session startup.
    /// Session will connect to these nodes to retrieve information about other nodes in the cluster.
    pub known_nodes: Vec<NodeInfo>,

    /// Replication of the keyspaces requests are routed for.
    /// Token-aware routing finds replicas only for keyspaces listed here.
    pub keyspaces: HashMap<String, ReplicationStrategy>,

    /// Number of reactor threads, which run all connections' I/O.
    pub thread_count_io: usize,

    /// Connections opened to each node up front.
    pub core_connections_per_host: usize,

    /// Upper bound on connections to one node; more are opened only when every
    /// connection runs out of stream ids.
    pub max_connections_per_host: usize,

    /// Connection timeout.
    /// The maximal time to wait until a connection to a node is ready for requests.
    pub connect_timeout: Duration,

    /// Cap on concurrent requests on one connection.
    pub max_streams_per_connection: usize,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by database server Session will fall back to no compression.
    pub compression: Option<Compression>,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// How long a connection may go without reading anything before it sends
    /// an OPTIONS heartbeat. If `None`, no heartbeats are sent.
    pub heartbeat_interval: Option<Duration>,

    /// How long a heartbeat may stay unanswered before its connection is
    /// considered dead and replaced.
    pub idle_timeout: Duration,

    /// Protocol version to start negotiation from.
    /// `None` means the highest version the driver supports.
    pub protocol_version: Option<ProtocolVersion>,

    /// Whether the vendor extension versions (DSE_V1, DSE_V2) may be negotiated.
    pub extension_protocol_enabled: bool,

    /// Provide our Session with TLS
    pub tls_context: Option<Arc<dyn TlsContext>>,

    /// How long to wait before refilling the pool of a node that lost all its connections.
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    /// The profile of statements that do not choose one.
    /// Options it leaves unset take the library defaults.
    pub default_execution_profile: ExecutionProfile,

    execution_profiles: HashMap<String, ExecutionProfile>,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * Reactor threads: 1
    /// * Connections per host: 1 core, 2 max
    /// * Connect timeout: 5 seconds
    /// * Compression: None
    /// * Heartbeat interval: 30 seconds, idle timeout: 60 seconds
    /// * Reconnection: every 2 seconds
    ///
    /// # Example
    /// ```
    /// # use kestrel::client::SessionConfig;
    /// let config = SessionConfig::new();
    /// ```
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            keyspaces: HashMap::new(),
            thread_count_io: 1,
            core_connections_per_host: 1,
            max_connections_per_host: 2,
            connect_timeout: Duration::from_secs(5),
            max_streams_per_connection: MAX_STREAM_IDS,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            protocol_version: None,
            extension_protocol_enabled: false,
            tls_context: None,
            reconnection_policy: Arc::new(ConstantReconnectionPolicy::new(Duration::from_secs(2))),
            default_execution_profile: ExecutionProfile::default(),
            execution_profiles: HashMap::new(),
        }
    }

    /// Adds a known database server with an IP address
    /// # Example
    /// ```
    /// # use kestrel::client::SessionConfig;
    /// # use std::net::{SocketAddr, IpAddr, Ipv4Addr};
    /// let mut config = SessionConfig::new();
    /// config.add_known_node_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042));
    /// ```
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(NodeInfo::new(node_addr));
    }

    /// Adds a known database server together with its datacenter, rack and tokens.
    pub fn add_known_node(&mut self, node: NodeInfo) {
        self.known_nodes.push(node);
    }

    /// Registers `profile` under `name`, replacing a profile registered before under it.
    pub fn set_execution_profile(&mut self, name: impl Into<String>, profile: ExecutionProfile) {
        self.execution_profiles.insert(name.into(), profile);
    }

    /// The profile registered under `name`.
    pub fn execution_profile(&self, name: &str) -> Option<&ExecutionProfile> {
        self.execution_profiles.get(name)
    }

    /// An independent copy of the configuration.
    ///
    /// The profile map is copied by value, so registering profiles on either copy
    /// does not affect the other. `mode` decides whether policies are shared.
    pub fn new_instance(&self, mode: ProfileCopyMode) -> SessionConfig {
        let mut copy = self.clone();
        if mode == ProfileCopyMode::Deep {
            copy.default_execution_profile = self.default_execution_profile.deep_copy();
            copy.execution_profiles = self
                .execution_profiles
                .iter()
                .map(|(name, profile)| (name.clone(), profile.deep_copy()))
                .collect();
        }
        copy
    }

    fn validate(&self) -> Result<(), NewSessionError> {
        if self.thread_count_io == 0 {
            return Err(NewSessionError::InvalidConfig(
                "thread_count_io must be at least 1".to_owned(),
            ));
        }
        if self.core_connections_per_host == 0 {
            return Err(NewSessionError::InvalidConfig(
                "core_connections_per_host must be at least 1".to_owned(),
            ));
        }
        if self.max_connections_per_host < self.core_connections_per_host {
            return Err(NewSessionError::InvalidConfig(format!(
                "max_connections_per_host ({}) is below core_connections_per_host ({})",
                self.max_connections_per_host, self.core_connections_per_host
            )));
        }
        if self.max_streams_per_connection == 0 || self.max_streams_per_connection > MAX_STREAM_IDS
        {
            return Err(NewSessionError::InvalidConfig(format!(
                "max_streams_per_connection must be between 1 and {}",
                MAX_STREAM_IDS
            )));
        }
        if self.heartbeat_interval == Some(Duration::ZERO) || self.idle_timeout.is_zero() {
            return Err(NewSessionError::InvalidConfig(
                "heartbeat_interval and idle_timeout must be positive".to_owned(),
            ));
        }
        if let Some(version) = self.protocol_version {
            if !version.is_valid() {
                return Err(NewSessionError::InvalidConfig(format!(
                    "protocol version {} is not supported",
                    version
                )));
            }
        }
        Ok(())
    }

    fn pool_config(&self) -> PoolConfig {
        let protocol_version = self
            .protocol_version
            .unwrap_or_else(|| ProtocolVersion::highest_supported(self.extension_protocol_enabled));
        PoolConfig {
            connection_config: ConnectionConfig {
                protocol_version,
                extension_protocol_enabled: self.extension_protocol_enabled,
                compression: self.compression,
                tcp_nodelay: self.tcp_nodelay,
                tcp_keepalive_interval: self.tcp_keepalive_interval,
                heartbeat_interval: self.heartbeat_interval,
                idle_timeout: self.idle_timeout,
                connect_timeout: self.connect_timeout,
                max_streams: self.max_streams_per_connection,
                tls_context: self.tls_context.clone(),
                ..Default::default()
            },
            core_connections: self.core_connections_per_host,
            max_connections: self.max_connections_per_host,
        }
    }
}

/// Creates default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `Session` manages connections to the cluster and allows to execute CQL requests.
pub struct Session {
    cluster: Cluster,
    reactors: Arc<ReactorGroup>,
    default_execution_profile_handle: ExecutionProfileHandle,
    execution_profile_handles: HashMap<String, ExecutionProfileHandle>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.cluster.get_state().get_nodes_info().len())
            .field("reactors", &self.reactors.len())
            .field(
                "default_execution_profile_handle",
                &self.default_execution_profile_handle,
            )
            .field(
                "execution_profiles",
                &self.execution_profile_handles.keys().collect::<Vec<_>>(),
            )
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Session {
    /// Establishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](super::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly.
    ///
    /// Starts the reactor threads, resolves the execution profiles, opens the control
    /// connection to the first reachable known node and a connection pool to every
    /// node that some profile's load balancing policy does not ignore.
    /// # Arguments
    /// * `config` - Connection configuration - known nodes, Compression, etc.
    ///   Must contain at least one known node.
    ///
    /// # Example
    /// ```rust
    /// # use std::error::Error;
    /// # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
    /// use kestrel::client::{Session, SessionConfig};
    ///
    /// let mut config = SessionConfig::new();
    /// config.add_known_node_addr("127.0.0.1:9042".parse()?);
    ///
    /// let session: Session = Session::connect(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        config.validate()?;
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let default_profile = Arc::new(ResolvedProfile::resolve(
            config.default_execution_profile.clone(),
            None,
        ));
        let named_profiles: HashMap<String, Arc<ResolvedProfile>> = config
            .execution_profiles
            .iter()
            .map(|(name, profile)| {
                let resolved = ResolvedProfile::resolve(profile.clone(), Some(&default_profile));
                (name.clone(), Arc::new(resolved))
            })
            .collect();

        let load_balancers = std::iter::once(&default_profile)
            .chain(named_profiles.values())
            .map(|profile| profile.load_balancer_uninit().clone())
            .collect();

        let reactors = Arc::new(ReactorGroup::new(config.thread_count_io));
        reactors.run()?;

        let cluster_config = ClusterConfig {
            known_nodes: config.known_nodes.clone(),
            keyspaces: config.keyspaces.clone(),
            pool_config: config.pool_config(),
            reconnection_policy: config.reconnection_policy.clone(),
            load_balancers,
        };
        let cluster = match Cluster::new(cluster_config, reactors.clone()).await {
            Ok(cluster) => cluster,
            Err(e) => {
                reactors.close_handles();
                return Err(e);
            }
        };
        info!(
            "Session connected with protocol version {}",
            cluster.protocol_version()
        );

        let execution_profile_handles = named_profiles
            .into_iter()
            .map(|(name, resolved)| {
                let handle = ExecutionProfileHandle::new(
                    resolved,
                    Some(default_profile.clone()),
                    Some(name.clone()),
                );
                (name, handle)
            })
            .collect();
        let default_execution_profile_handle = ExecutionProfileHandle::new(default_profile, None, None);

        Ok(Session {
            cluster,
            reactors,
            default_execution_profile_handle,
            execution_profile_handles,
            closed: AtomicBool::new(false),
        })
    }

    /// Sends a request to the database and returns a future of its result.
    ///
    /// The request runs on one of the session's reactor threads: it does not need to be
    /// polled to make progress, and dropping the future does not cancel it.
    ///
    /// The statement's execution profile is resolved first: its handle, else the profile
    /// registered under its name, else the default profile. An unregistered name fails
    /// the request with [`ProfileError::UnknownProfile`].
    ///
    /// # Example
    /// ```rust
    /// # use kestrel::client::Session;
    /// # use std::error::Error;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
    /// use kestrel::statement::Statement;
    ///
    /// let statement = Statement::new("INSERT INTO ks.tab (a, b) VALUES(?, ?)")
    ///     .bind(&(2_i32, "some text"))?
    ///     .with_execution_profile("writes");
    /// session.execute(statement).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn execute(&self, statement: impl Into<Statement>) -> ResultFuture {
        let statement = statement.into();
        if self.closed.load(Ordering::Acquire) {
            return ResultFuture::ready(Err(ExecutionError::SessionClosed));
        }

        let handle = match self.profile_handle(&statement) {
            Ok(handle) => handle,
            Err(e) => return ResultFuture::ready(Err(e.into())),
        };

        let execution = RequestExecution {
            cluster_state: self.cluster.get_state(),
            profile: handle.access(),
            statement,
        };
        let (promise, future) = ResultFuture::new();
        let added = self.reactors.add(async move {
            let (result, history) = execution.run().await;
            promise.complete(result, history);
        });
        match added {
            Ok(_) => future,
            Err(e) => ResultFuture::ready(Err(e.into())),
        }
    }

    /// Prepares a statement on the cluster and returns it ready to be executed by id.
    ///
    /// PREPARE is sent to every node of the statement's query plan, so that any of
    /// them can serve the statement right away; one node accepting it is enough.
    /// Values, options and the execution profile of `statement` are kept, and the
    /// returned statement can be bound again any number of times.
    ///
    /// # Example
    /// ```rust
    /// # use kestrel::client::Session;
    /// # use std::error::Error;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
    /// let prepared = session
    ///     .prepare("INSERT INTO ks.tab (a, b) VALUES(?, ?)")
    ///     .await?;
    /// session.execute(prepared.clone().bind(&(1_i32, "one"))?).await?;
    /// session.execute(prepared.bind(&(2_i32, "two"))?).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn prepare(&self, statement: impl Into<Statement>) -> Result<Statement, ExecutionError> {
        let statement = statement.into();
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutionError::SessionClosed);
        }

        let execution = PrepareExecution {
            cluster_state: self.cluster.get_state(),
            profile: self.profile_handle(&statement)?.access(),
            statement,
        };
        self.reactors
            .next_reactor()
            .spawn(execution.run())
            .await?
    }

    fn profile_handle<'a>(&'a self, statement: &'a Statement) -> Result<&'a ExecutionProfileHandle, ProfileError> {
        match &statement.config.execution_profile {
            None => Ok(&self.default_execution_profile_handle),
            Some(ProfileSelector::Handle(handle)) => Ok(handle),
            Some(ProfileSelector::Name(name)) => {
                self.execution_profile_handles.get(name).ok_or_else(|| {
                    debug!("Statement refers to an unknown execution profile '{}'", name);
                    ProfileError::UnknownProfile(name.clone())
                })
            }
        }
    }

    /// Applies a topology event to the session's view of the cluster, as if the
    /// control connection had received it. Returns once the new view is in place.
    pub async fn handle_topology_event(&self, event: TopologyEvent) -> Result<(), ExecutionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutionError::SessionClosed);
        }
        self.cluster.handle_topology_event(event).await
    }

    /// Access cluster state visible by the driver.
    pub fn get_cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.get_state()
    }

    /// The protocol version negotiated with the cluster.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.cluster.protocol_version()
    }

    /// Retrieves the handle to execution profile that is used by this session
    /// by default, i.e. when an executed statement does not define its own handle.
    pub fn get_default_execution_profile_handle(&self) -> &ExecutionProfileHandle {
        &self.default_execution_profile_handle
    }

    /// Retrieves the handle of the profile registered under `name`.
    pub fn get_execution_profile_handle(&self, name: &str) -> Option<&ExecutionProfileHandle> {
        self.execution_profile_handles.get(name)
    }

    /// Shuts the session down: closes every connection pool, stops the reactor
    /// threads and waits for them to exit.
    ///
    /// Requests still running fail with [`ExecutionError::SessionClosed`].
    /// Blocks the calling thread, which must not be one of the session's reactors.
    pub fn close(&self) -> Result<(), ReactorError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing session");
        self.cluster.close();
        self.reactors.close_handles();
        self.reactors.join()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Reactor threads exit on their own once their handles are closed.
            self.cluster.close();
            self.reactors.close_handles();
            warn!("Session dropped without close(); reactor threads are not joined");
        }
    }
}
