//! Finding a protocol version both the driver and a node speak.
//!
//! A connection offers its configured version first. Whenever the node rejects
//! the offered version, the connection is discarded and a fresh one offers the
//! next lower version, until one is accepted or the lowest supported version
//! has been rejected too.

use std::net::SocketAddr;

use kestrel_cql::frame::protocol_version::ProtocolVersion;
use tracing::debug;

use super::connection::{open_connection, Connection, ConnectionConfig, ErrorReceiver};
use crate::errors::{ConnectionError, ProtocolNegotiationError};

/// Walks down the version ladder, one step per rejection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProtocolNegotiator {
    current: ProtocolVersion,
}

impl ProtocolNegotiator {
    pub(crate) fn new(start: ProtocolVersion) -> Result<Self, ProtocolNegotiationError> {
        if !start.is_valid() {
            return Err(ProtocolNegotiationError::InvalidStartVersion(start));
        }
        Ok(ProtocolNegotiator { current: start })
    }

    /// The version to offer next.
    pub(crate) fn current(&self) -> ProtocolVersion {
        self.current
    }

    /// Records that `current()` was rejected and moves one version down.
    pub(crate) fn on_unsupported(&mut self) -> Result<ProtocolVersion, ProtocolNegotiationError> {
        let previous = self.current.previous();
        if !previous.is_valid() {
            return Err(ProtocolNegotiationError::NoSupportedVersion {
                lowest_attempted: self.current,
            });
        }
        self.current = previous;
        Ok(previous)
    }
}

/// Opens a connection, downgrading the protocol version until the node accepts one.
///
/// The version that worked is available through [`Connection::protocol_version`].
pub(crate) async fn open_negotiated_connection(
    address: SocketAddr,
    config: &ConnectionConfig,
    reactor_index: usize,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let mut negotiator = ProtocolNegotiator::new(config.protocol_version)?;
    let mut config = config.clone();

    loop {
        config.protocol_version = negotiator.current();
        match open_connection(address, &config, reactor_index).await {
            Err(err) if err.is_unsupported_protocol_version() => {
                let rejected = negotiator.current();
                let next = negotiator.on_unsupported()?;
                debug!(
                    "Node {} rejected protocol version {}, retrying with {}",
                    address, rejected, next
                );
            }
            result => return result,
        }
    }
}
