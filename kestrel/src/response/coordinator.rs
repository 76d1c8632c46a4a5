use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::{Node, NodeRef};
use crate::network::Connection;

/// The coordinator of a CQL request, i.e., the node that received
/// and processed the request and sent back the response.
#[derive(Debug, Clone)]
pub struct Coordinator {
    /// The address the connection was opened against.
    connection_address: SocketAddr,
    node: Arc<Node>,
    /// Reactor thread the connection lives on.
    reactor_index: usize,
}

impl Coordinator {
    pub(crate) fn new(node: NodeRef<'_>, connection: &Connection) -> Self {
        Self {
            connection_address: connection.connect_address(),
            node: Arc::clone(node),
            reactor_index: connection.reactor_index(),
        }
    }

    /// The address the connection was opened against.
    #[inline]
    pub fn connection_address(&self) -> SocketAddr {
        self.connection_address
    }

    /// The node that served as coordinator of the request.
    #[inline]
    pub fn node(&self) -> NodeRef<'_> {
        &self.node
    }

    /// Index of the reactor whose connection carried the request.
    #[inline]
    pub fn reactor_index(&self) -> usize {
        self.reactor_index
    }
}
