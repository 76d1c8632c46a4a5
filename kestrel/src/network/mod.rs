//! Connections to the nodes, and the reactor threads they live on.

mod connection;
mod connection_pool;
mod protocol_negotiation;
mod reactor;
mod tls;

pub use connection::ConnectionState;
pub(crate) use connection::{
    Connection, ConnectionConfig, ErrorReceiver, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT,
    MAX_STREAM_IDS,
};
pub(crate) use connection_pool::{NodeConnectionPool, PoolConfig, PoolEmptied};
pub(crate) use protocol_negotiation::open_negotiated_connection;
pub(crate) use reactor::ReactorGroup;
pub use tls::{TlsContext, TlsError, TlsStream};

#[cfg(feature = "unstable-testing")]
pub use connection::StreamIdSet;
