use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::routing::locator::{ReplicaLocator, ReplicaSet, ReplicationStrategy};
use crate::routing::partitioner::Murmur3Partitioner;
use crate::routing::Token;

use super::node::{Node, NodeRef};

/// Represents the state of the cluster: known nodes, datacenters and the token ring.
///
/// It is immutable after creation, and is replaced atomically when the topology changes.
/// Node states (up/down) change in place, without a new `ClusterState`.
/// Can be accessed through [Session::get_cluster_state()](crate::client::session::Session::get_cluster_state).
#[derive(Clone)]
pub struct ClusterState {
    /// All nodes, in the order they became known. Known nodes from the configuration come first.
    pub(crate) all_nodes: Vec<Arc<Node>>,

    pub(crate) known_peers: HashMap<SocketAddr, Arc<Node>>,

    /// Nodes of each datacenter, in the same order as in `all_nodes`.
    pub(crate) datacenters: HashMap<String, Vec<Arc<Node>>>,

    /// Replication settings of keyspaces, as given in the configuration.
    pub(crate) keyspaces: HashMap<String, ReplicationStrategy>,

    pub(crate) locator: ReplicaLocator,
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field(
                "nodes",
                &self
                    .all_nodes
                    .iter()
                    .map(|node| (node.address, node.state()))
                    .collect::<Vec<_>>(),
            )
            .field("ring_size", &self.locator.ring().len())
            .field("keyspaces", &self.keyspaces.keys())
            .finish_non_exhaustive()
    }
}

impl ClusterState {
    pub(crate) fn new(
        all_nodes: Vec<Arc<Node>>,
        keyspaces: HashMap<String, ReplicationStrategy>,
    ) -> Self {
        let known_peers = all_nodes
            .iter()
            .map(|node| (node.address, node.clone()))
            .collect();

        let mut datacenters: HashMap<String, Vec<Arc<Node>>> = HashMap::new();
        for node in &all_nodes {
            if let Some(dc) = &node.datacenter {
                datacenters.entry(dc.clone()).or_default().push(node.clone());
            }
        }

        let locator = ReplicaLocator::new(all_nodes.iter());

        ClusterState {
            all_nodes,
            known_peers,
            datacenters,
            keyspaces,
            locator,
        }
    }

    /// Up nodes without connection pools, for running policies outside a session.
    #[cfg(feature = "unstable-testing")]
    #[doc(hidden)]
    pub fn new_unpooled(
        nodes: impl IntoIterator<Item = super::NodeInfo>,
        keyspaces: HashMap<String, ReplicationStrategy>,
    ) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|info| {
                Arc::new(Node::new(
                    uuid::Uuid::new_v4(),
                    info,
                    super::NodeState::Up,
                    None,
                ))
            })
            .collect();
        ClusterState::new(nodes, keyspaces)
    }

    /// Access to the list of all nodes known to the driver.
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    /// The node listening on `address`, if known.
    pub fn get_node(&self, address: SocketAddr) -> Option<NodeRef<'_>> {
        self.known_peers.get(&address)
    }

    /// Nodes grouped by datacenter. Nodes without a datacenter are not listed.
    pub fn get_datacenters_info(&self) -> &HashMap<String, Vec<Arc<Node>>> {
        &self.datacenters
    }

    /// Replication settings of a keyspace, if configured.
    pub fn get_keyspace_replication(&self, keyspace: &str) -> Option<&ReplicationStrategy> {
        self.keyspaces.get(keyspace)
    }

    /// Computes the token of a serialized routing key.
    pub fn compute_token(&self, routing_key: &[u8]) -> Token {
        Murmur3Partitioner.token(routing_key)
    }

    /// Replicas owning `token` in `keyspace`. Empty if the keyspace's replication is unknown.
    pub fn get_token_endpoints(&self, keyspace: &str, token: Token) -> ReplicaSet<'_> {
        match self.keyspaces.get(keyspace) {
            Some(strategy) => self.locator.replicas_for_token(token, strategy),
            None => ReplicaSet::new(),
        }
    }

    /// Access replica location info
    pub fn replica_locator(&self) -> &ReplicaLocator {
        &self.locator
    }

    /// The same nodes, with `node` added at the end.
    pub(crate) fn with_added_node(&self, node: Arc<Node>) -> ClusterState {
        let mut all_nodes = self.all_nodes.clone();
        all_nodes.push(node);
        ClusterState::new(all_nodes, self.keyspaces.clone())
    }

    /// The same nodes, without the one listening on `address`.
    pub(crate) fn without_node(&self, address: SocketAddr) -> ClusterState {
        let all_nodes = self
            .all_nodes
            .iter()
            .filter(|node| node.address != address)
            .cloned()
            .collect();
        ClusterState::new(all_nodes, self.keyspaces.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::routing::locator::ReplicationStrategy;
    use crate::routing::Token;
    use crate::utils::test_utils::{mock_cluster_state, mock_node, setup_tracing};

    #[test]
    fn nodes_are_grouped_by_datacenter_in_order() {
        setup_tracing();
        let state = mock_cluster_state(&[
            (1, "dc1", &[10]),
            (2, "dc2", &[20]),
            (3, "dc1", &[30]),
        ]);
        let dc1: Vec<_> = state.get_datacenters_info()["dc1"]
            .iter()
            .map(|n| n.address)
            .collect();
        assert_eq!(dc1, vec![state.all_nodes[0].address, state.all_nodes[2].address]);
        assert_eq!(state.get_node(state.all_nodes[1].address), Some(&state.all_nodes[1]));
    }

    #[test]
    fn topology_updates_produce_new_snapshots() {
        setup_tracing();
        let state = mock_cluster_state(&[(1, "dc1", &[10]), (2, "dc1", &[20])]);
        let added = state.with_added_node(mock_node(3, "dc2", &[30]));
        assert_eq!(added.get_nodes_info().len(), 3);
        assert_eq!(added.replica_locator().ring().len(), 3);
        assert_eq!(state.get_nodes_info().len(), 2);

        let removed = added.without_node(state.all_nodes[0].address);
        assert_eq!(removed.get_nodes_info().len(), 2);
        assert!(removed.get_node(state.all_nodes[0].address).is_none());
    }

    #[test]
    fn token_endpoints_need_keyspace_replication() {
        setup_tracing();
        let mut state = mock_cluster_state(&[(1, "dc1", &[10]), (2, "dc1", &[20])]);
        assert!(state.get_token_endpoints("ks", Token::new(15)).is_empty());

        state.keyspaces = HashMap::from([(
            "ks".to_owned(),
            ReplicationStrategy::Simple {
                replication_factor: 1,
            },
        )]);
        let replicas = state.get_token_endpoints("ks", Token::new(15));
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].address, state.all_nodes[1].address);
    }
}
