//! SessionBuilder provides an easy way to create new Sessions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kestrel_cql::frame::protocol_version::ProtocolVersion;

use super::execution_profile::ExecutionProfile;
use super::session::{Session, SessionConfig};
use super::Compression;
use crate::cluster::NodeInfo;
use crate::errors::NewSessionError;
use crate::network::TlsContext;
use crate::policies::reconnection::ReconnectionPolicy;
use crate::routing::locator::ReplicationStrategy;

/// SessionBuilder is used to create new Session instances
/// # Example
///
/// ```
/// # use kestrel::client::{Compression, Session, SessionBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042".parse()?)
///     .compression(Some(Compression::Snappy))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates new SessionBuilder with default configuration
    /// # Default configuration
    /// * Compression: None
    ///
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Add a known node with an IP address
    /// # Example
    /// ```
    /// # use kestrel::client::{Session, SessionBuilder};
    /// # use std::net::{SocketAddr, IpAddr, Ipv4Addr};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Add a list of known nodes with IP addresses
    pub fn known_nodes(mut self, node_addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        for address in node_addrs {
            self.config.add_known_node_addr(address);
        }
        self
    }

    /// Add a known node together with its datacenter, rack and tokens.
    /// # Example
    /// ```
    /// # use kestrel::client::{Session, SessionBuilder};
    /// # use kestrel::cluster::NodeInfo;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let node = NodeInfo::new("127.0.0.1:9042".parse()?)
    ///     .with_datacenter("dc1")
    ///     .with_tokens([-3074457345618258603, 3074457345618258602]);
    /// let session: Session = SessionBuilder::new().known_node_info(node).build().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node_info(mut self, node: NodeInfo) -> Self {
        self.config.add_known_node(node);
        self
    }

    /// Declares how `keyspace` is replicated, so that token-aware routing can find
    /// the replicas of its partitions.
    pub fn keyspace_replication(
        mut self,
        keyspace: impl Into<String>,
        strategy: ReplicationStrategy,
    ) -> Self {
        self.config.keyspaces.insert(keyspace.into(), strategy);
        self
    }

    /// Number of reactor threads running the session's I/O. Defaults to 1.
    pub fn thread_count_io(mut self, threads: usize) -> Self {
        self.config.thread_count_io = threads;
        self
    }

    /// Connections opened to each node up front, and the most the pool grows to
    /// when all of them run out of stream ids.
    /// # Example
    /// ```
    /// # use kestrel::client::{Session, SessionBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042".parse()?)
    ///     .connections_per_host(2, 4)
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connections_per_host(mut self, core: usize, max: usize) -> Self {
        self.config.core_connections_per_host = core;
        self.config.max_connections_per_host = max;
        self
    }

    /// Changes connection timeout
    /// The default is 5 seconds.
    /// If it's higher than underlying os's default connection timeout it won't effect.
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Caps the number of requests in flight on one connection.
    pub fn max_streams_per_connection(mut self, max_streams: usize) -> Self {
        self.config.max_streams_per_connection = max_streams;
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    /// If it is not supported by database server Session will fall back to no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive interval.
    /// The default is `None`, which implies that no keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        if interval <= Duration::from_secs(1) {
            tracing::warn!(
                "Setting the TCP keepalive interval to low values ({:?}) is not recommended as it can have a negative impact on performance. Consider setting it above 1 second.",
                interval
            );
        }

        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// How long a connection may go without reading anything before it sends
    /// an OPTIONS heartbeat. The default is 30 seconds.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = Some(interval);
        self
    }

    /// Turns connection heartbeats off.
    pub fn no_heartbeats(mut self) -> Self {
        self.config.heartbeat_interval = None;
        self
    }

    /// How long a heartbeat may stay unanswered before its connection is
    /// replaced. The default is 60 seconds.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Protocol version to start negotiation from. The session settles on the
    /// highest version at or below it that the cluster accepts.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = Some(version);
        self
    }

    /// Allows negotiating the vendor extension protocol versions.
    pub fn extension_protocol_enabled(mut self, enabled: bool) -> Self {
        self.config.extension_protocol_enabled = enabled;
        self
    }

    /// Wraps every connection in TLS, established before protocol negotiation.
    pub fn tls_context(mut self, tls_context: Option<Arc<dyn TlsContext>>) -> Self {
        self.config.tls_context = tls_context;
        self
    }

    /// Sets how long to wait before refilling the pool of a node that lost all its connections.
    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    /// Sets the profile used by statements that do not choose one.
    /// # Example
    /// ```
    /// # use kestrel::client::{ExecutionProfile, Session, SessionBuilder};
    /// # use kestrel::statement::Consistency;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let profile = ExecutionProfile::builder()
    ///     .consistency(Consistency::All)
    ///     .request_timeout(Some(std::time::Duration::from_secs(2)))
    ///     .build();
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042".parse()?)
    ///     .default_execution_profile(profile)
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn default_execution_profile(mut self, profile: ExecutionProfile) -> Self {
        self.config.default_execution_profile = profile;
        self
    }

    /// Registers a profile statements can choose by name.
    pub fn execution_profile(mut self, name: impl Into<String>, profile: ExecutionProfile) -> Self {
        self.config.set_execution_profile(name, profile);
        self
    }

    /// Builds the Session after setting all the options.
    /// # Example
    /// ```
    /// # use kestrel::client::{Compression, Session, SessionBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042".parse()?)
    ///     .compression(Some(Compression::Snappy))
    ///     .build() // Turns SessionBuilder into Session
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

/// Creates a [`SessionBuilder`] with default configuration, same as [`SessionBuilder::new`]
impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}
