//! This module contains various errors which can be returned by [`Session`](crate::client::session::Session)
//! and by the machinery underneath it.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use kestrel_cql::frame::response::error::{DbError, WriteType};

use kestrel_cql::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameError,
};
use kestrel_cql::frame::protocol_version::ProtocolVersion;
use kestrel_cql::frame::request::RequestOpcode;
use kestrel_cql::frame::response::ResponseOpcode;
use thiserror::Error;

use crate::network::TlsError;

/// Error that occurred during request execution, as seen by the caller.
///
/// When several attempts were made, this is the error of the last one.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The query plan offered no node to send the request to.
    #[error("No hosts available to execute the request")]
    NoHostsAvailable,

    /// The last attempt failed, and the retry policy decided not to go on.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// Failed to obtain a connection to the last node in the plan.
    #[error("Could not get a connection to {node}: {error}")]
    ConnectionPoolError {
        node: SocketAddr,
        error: ConnectionPoolError,
    },

    /// The request did not complete within the configured request timeout.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The request named an execution profile that is not registered.
    #[error(transparent)]
    ProfileError(#[from] ProfileError),

    /// The request could not be handed to a reactor.
    #[error(transparent)]
    ReactorError(#[from] ReactorError),

    /// The session was closed before the request completed.
    #[error("Session was closed before the request completed")]
    SessionClosed,
}

/// An error returned by a single attempt of a request, on a single connection.
///
/// These errors are what the retry policy classifies.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// The request could not be serialized.
    #[error("Failed to serialize the request: {0}")]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),

    /// All stream ids of the chosen connection were in use.
    #[error("Unable to allocate stream id: no streams available on the connection")]
    NoStreamsAvailable,

    /// The connection broke while the request was in flight.
    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    /// Body extensions (tracing id, warnings) of the response were malformed.
    #[error("Failed to parse response body extensions: {0}")]
    BodyExtensionsParseError(FrameError),

    /// The response body was malformed.
    #[error("Failed to parse the response: {0}")]
    CqlResponseParseError(#[from] CqlResponseParseError),

    /// The database sent an ERROR response.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// A statement prepared again after an UNPREPARED error came back with another id.
    #[error(
        "Reprepared statement unexpectedly changed its id: expected {expected_id:?}, got {reprepared_id:?}, statement: {statement}"
    )]
    RepreparedIdChanged {
        statement: String,
        expected_id: Vec<u8>,
        reprepared_id: Vec<u8>,
    },

    /// The database answered with a response that makes no sense for the request.
    #[error("Received unexpected response from the server: {0:?}. Expected RESULT or ERROR response.")]
    UnexpectedResponse(ResponseOpcode),
}

/// The connection to the node broke. Every request in flight on it fails with this error.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    /// The reason the connection broke.
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

/// The reason a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Reading a frame header or body from the socket failed.
    #[error("Failed to read a frame: {0}")]
    FrameError(FrameError),

    /// Writing to the socket failed.
    #[error("Failed to write data: {0}")]
    WriteError(std::io::Error),

    /// The router task of the connection is gone.
    #[error("The connection's router is no longer running")]
    ChannelError,

    /// An EVENT frame could not be parsed.
    #[error("Failed to parse a server event: {0}")]
    EventParseError(CqlResponseParseError),

    /// Too many requests were abandoned by their callers and never answered.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// An idle connection did not answer a heartbeat within the idle timeout.
    #[error("No response to a heartbeat on connection to {0} within {1:?}")]
    HeartbeatTimeout(SocketAddr, Duration),

    /// A heartbeat request failed.
    #[error("Heartbeat request failed: {0}")]
    HeartbeatRequestError(Arc<RequestAttemptError>),

    /// The connection was closed on purpose.
    #[error("The connection was closed")]
    Closed,
}

/// An error that occurred when opening a connection or while it was running.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The TCP connection was not established within the connect timeout.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// An I/O error on the socket.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// The TLS handshake failed.
    #[error(transparent)]
    TlsError(#[from] TlsError),

    /// One of the setup requests (OPTIONS, STARTUP, REGISTER) failed.
    #[error(transparent)]
    ConnectionSetupError(#[from] ConnectionSetupError),

    /// No protocol version acceptable for both sides was found.
    #[error(transparent)]
    ProtocolNegotiation(#[from] ProtocolNegotiationError),

    /// The connection broke after it was set up.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The reactor that should own the connection is not accepting work.
    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

impl ConnectionError {
    /// Checks if this error indicates that a chosen source port/address cannot be bound.
    pub fn is_address_unavailable_for_use(&self) -> bool {
        if let ConnectionError::IoError(io_error) = self {
            match io_error.kind() {
                ErrorKind::AddrInUse | ErrorKind::PermissionDenied => return true,
                _ => {}
            }
        }

        false
    }

    /// Whether the peer rejected the protocol version the connection offered.
    pub(crate) fn is_unsupported_protocol_version(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionSetupError(ConnectionSetupError {
                error: ConnectionSetupErrorKind::UnsupportedProtocolVersion { .. },
                ..
            })
        )
    }
}

/// A setup request failed while opening a connection.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request_kind}, reason: {error}")]
pub struct ConnectionSetupError {
    /// The request that failed.
    pub request_kind: RequestOpcode,
    /// What went wrong.
    pub error: ConnectionSetupErrorKind,
}

impl ConnectionSetupError {
    pub(crate) fn new(request_kind: RequestOpcode, error: ConnectionSetupErrorKind) -> Self {
        ConnectionSetupError {
            request_kind,
            error,
        }
    }
}

/// The reason a setup request failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupErrorKind {
    /// The request could not be serialized.
    #[error("Failed to serialize the request: {0}")]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),

    /// The response could not be parsed.
    #[error("Failed to parse the response: {0}")]
    CqlResponseParse(#[from] CqlResponseParseError),

    /// Body extensions of the response could not be parsed.
    #[error("Failed to parse response body extensions: {0}")]
    BodyExtensionsParse(FrameError),

    /// The server answered with an ERROR.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The server answered with a response the request does not expect.
    #[error("Received unexpected response from the server: {0:?}")]
    UnexpectedResponse(ResponseOpcode),

    /// The peer does not speak the requested protocol version.
    #[error("Protocol version {requested} rejected by the server: {reason}")]
    UnsupportedProtocolVersion {
        requested: ProtocolVersion,
        reason: String,
    },

    /// The server requires authentication, which this driver does not perform.
    #[error("Server requires authentication with {0}, which is not supported")]
    AuthenticationNotSupported(String),

    /// The connection broke during setup.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// No stream id was free for the setup request.
    #[error("Unable to allocate stream id")]
    NoStreamsAvailable,
}

impl From<RequestAttemptError> for ConnectionSetupErrorKind {
    fn from(value: RequestAttemptError) -> Self {
        match value {
            RequestAttemptError::CqlRequestSerialization(e) => {
                ConnectionSetupErrorKind::CqlRequestSerialization(e)
            }
            RequestAttemptError::NoStreamsAvailable => ConnectionSetupErrorKind::NoStreamsAvailable,
            RequestAttemptError::BrokenConnectionError(e) => {
                ConnectionSetupErrorKind::BrokenConnection(e)
            }
            RequestAttemptError::BodyExtensionsParseError(e) => {
                ConnectionSetupErrorKind::BodyExtensionsParse(e)
            }
            RequestAttemptError::CqlResponseParseError(e) => {
                ConnectionSetupErrorKind::CqlResponseParse(e)
            }
            RequestAttemptError::DbError(db_error, reason) => {
                ConnectionSetupErrorKind::DbError(db_error, reason)
            }
            RequestAttemptError::UnexpectedResponse(opcode) => {
                ConnectionSetupErrorKind::UnexpectedResponse(opcode)
            }
            // Setup requests are never prepared statements.
            RequestAttemptError::RepreparedIdChanged { .. } => {
                ConnectionSetupErrorKind::UnexpectedResponse(ResponseOpcode::Result)
            }
        }
    }
}

/// Protocol version negotiation gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolNegotiationError {
    /// The configured starting version is below the lowest one the driver speaks.
    #[error("Protocol version {0} is invalid; the lowest supported version is {lowest}", lowest = ProtocolVersion::lowest_supported())]
    InvalidStartVersion(ProtocolVersion),

    /// Every version down to the lowest supported one was rejected.
    #[error("The server rejected every protocol version down to {lowest_attempted}")]
    NoSupportedVersion {
        /// The last version that was offered.
        lowest_attempted: ProtocolVersion,
    },
}

/// The connection pool of a node could not provide a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// The pool has no working connection and is not opening any.
    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        /// The most recent connection error seen by the pool.
        last_connection_error: ConnectionError,
    },

    /// The pool is still opening its first connection.
    #[error("Pool is still being initialized")]
    Initializing,

    /// The pool was closed, because its node was removed or the session shut down.
    #[error("The pool is closed")]
    Closed,

    /// Every load balancing policy ignores the node, so it has no pool.
    #[error("The node is ignored by the load balancing policies and has no pool")]
    NodeIgnored,
}

/// Errors of the reactor threads.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ReactorError {
    /// The reactor thread could not be spawned.
    #[error("Failed to spawn reactor thread: {0}")]
    Spawn(Arc<std::io::Error>),

    /// The reactor is not running (not started yet, or already closed).
    #[error("Reactor {0} is not accepting tasks")]
    Closed(usize),

    /// The reactor thread panicked.
    #[error("Reactor {0} thread panicked")]
    Panicked(usize),
}

/// An execution profile was referred to by a name that is not registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProfileError {
    /// There is no profile with that name.
    #[error("Execution profile '{0}' does not exist")]
    UnknownProfile(String),
}

/// Error that occurred during session creation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// There needs to be at least one node to connect to.
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// Could not connect to any of the known nodes.
    #[error("Could not connect to any known node; last error: {0}")]
    FailedToConnect(ConnectionError),

    /// The configuration is self-contradictory.
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    /// The reactor threads could not be started.
    #[error(transparent)]
    Reactor(#[from] ReactorError),

    /// A profile could not be resolved.
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

#[cfg(test)]
mod tests {
    use kestrel_cql::Consistency;

    use super::{DbError, RequestAttemptError};

    // Displaying an attempt error shows the error description,
    // its parameters and the server's message.
    #[test]
    fn dberror_full_info() {
        let db_error = DbError::Unavailable {
            consistency: Consistency::Three,
            required: 3,
            alive: 2,
        };

        let db_error_displayed: String = format!("{}", db_error);

        let mut expected_dberr_msg =
            "Not enough nodes are alive to satisfy required consistency level ".to_string();
        expected_dberr_msg += "(consistency: Three, required: 3, alive: 2)";

        assert_eq!(db_error_displayed, expected_dberr_msg);

        let attempt_error =
            RequestAttemptError::DbError(db_error, "a message about unavailable error".to_string());
        let attempt_error_displayed: String = format!("{}", attempt_error);

        let mut expected_msg = "Database returned an error: ".to_string();
        expected_msg += &expected_dberr_msg;
        expected_msg += ", Error message: a message about unavailable error";

        assert_eq!(attempt_error_displayed, expected_msg);
    }
}
