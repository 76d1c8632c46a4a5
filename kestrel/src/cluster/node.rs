use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::errors::ConnectionPoolError;
use crate::network::{Connection, NodeConnectionPool};
use crate::routing::Token;

/// Lifecycle of a node as seen by the driver.
///
/// Only `Up` nodes appear in query plans. `Removed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeState {
    /// The node is known, but not yet announced as up.
    Added = 0,
    /// The node accepts requests.
    Up = 1,
    /// The node was reported down.
    Down = 2,
    /// The node left the cluster.
    Removed = 3,
}

impl NodeState {
    fn from_u8(raw: u8) -> NodeState {
        match raw {
            0 => NodeState::Added,
            1 => NodeState::Up,
            2 => NodeState::Down,
            _ => NodeState::Removed,
        }
    }
}

/// What the driver knows about a node before it connects: where it is and what it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Address of the node's CQL port.
    pub address: SocketAddr,
    /// Datacenter the node belongs to.
    pub datacenter: Option<String>,
    /// Rack the node belongs to.
    pub rack: Option<String>,
    /// Tokens owned by the node, used for token-aware routing.
    pub tokens: Vec<Token>,
}

impl NodeInfo {
    /// A node with no datacenter, rack or tokens.
    pub fn new(address: SocketAddr) -> Self {
        NodeInfo {
            address,
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
        }
    }

    /// Sets the datacenter of the node.
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Sets the rack of the node.
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }

    /// Sets the tokens the node owns.
    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = i64>) -> Self {
        self.tokens = tokens.into_iter().map(Token::new).collect();
        self
    }
}

impl From<SocketAddr> for NodeInfo {
    fn from(address: SocketAddr) -> Self {
        NodeInfo::new(address)
    }
}

/// Node represents a cluster node along with its data and connections
///
/// Note: if a Node changes its address, it is treated as a different node.
#[derive(Debug)]
pub struct Node {
    /// Identifies the node for the lifetime of the session.
    pub host_id: Uuid,
    /// Address of the node's CQL port.
    pub address: SocketAddr,
    /// Datacenter the node belongs to.
    pub datacenter: Option<String>,
    /// Rack the node belongs to.
    pub rack: Option<String>,
    /// Tokens owned by the node.
    pub tokens: Vec<Token>,

    state: AtomicU8,
    // None if every load balancing policy ignores the node.
    pool: Option<NodeConnectionPool>,
}

/// A way that Nodes are often passed and accessed in the driver's code.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    pub(crate) fn new(
        host_id: Uuid,
        info: NodeInfo,
        state: NodeState,
        pool: Option<NodeConnectionPool>,
    ) -> Self {
        Node {
            host_id,
            address: info.address,
            datacenter: info.datacenter,
            rack: info.rack,
            tokens: info.tokens,
            state: AtomicU8::new(state as u8),
            pool,
        }
    }

    /// Current state of the node.
    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the node may be put in query plans.
    #[inline]
    pub fn is_up(&self) -> bool {
        self.state() == NodeState::Up
    }

    // Once Removed, the state never changes again.
    pub(crate) fn set_state(&self, state: NodeState) -> NodeState {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != NodeState::Removed as u8).then_some(state as u8)
            })
            .unwrap_or_else(|removed| removed);
        NodeState::from_u8(previous)
    }

    /// Whether the node has at least one ready connection.
    pub fn is_connected(&self) -> bool {
        self.pool.as_ref().is_some_and(NodeConnectionPool::is_connected)
    }

    /// Whether the driver keeps connections to this node at all.
    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub(crate) fn pool(&self) -> Option<&NodeConnectionPool> {
        self.pool.as_ref()
    }

    pub(crate) async fn connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        match &self.pool {
            Some(pool) => pool.acquire().await,
            None => Err(ConnectionPoolError::NodeIgnored),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::NodeState;
    use crate::utils::test_utils::mock_node;

    #[test]
    fn removed_node_stays_removed() {
        let node = mock_node(1, "dc1", &[]);
        assert!(node.is_up());
        assert_eq!(node.set_state(NodeState::Down), NodeState::Up);
        assert!(!node.is_up());

        node.set_state(NodeState::Removed);
        assert_eq!(node.set_state(NodeState::Up), NodeState::Removed);
        assert_eq!(node.state(), NodeState::Removed);
    }

    #[test]
    fn nodes_without_pool_are_disabled() {
        let node = mock_node(1, "dc1", &[]);
        assert!(!node.is_enabled());
        assert!(!node.is_connected());
    }
}
