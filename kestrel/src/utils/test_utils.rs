use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use uuid::Uuid;

use crate::cluster::{ClusterState, Node, NodeInfo, NodeState};
use crate::network::ReactorGroup;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// A group of `size` reactors, already running.
pub(crate) fn running_reactors(size: usize) -> Arc<ReactorGroup> {
    let reactors = Arc::new(ReactorGroup::new(size));
    reactors.run().unwrap();
    reactors
}

pub(crate) async fn shutdown_reactors(reactors: Arc<ReactorGroup>) {
    reactors.close_handles();
    tokio::task::spawn_blocking(move || reactors.join())
        .await
        .unwrap()
        .unwrap();
}

/// An Up node at 127.0.0.`last_octet`:9042, without a connection pool.
pub(crate) fn mock_node(last_octet: u8, datacenter: &str, tokens: &[i64]) -> Arc<Node> {
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, last_octet)), 9042);
    let info = NodeInfo::new(address)
        .with_datacenter(datacenter)
        .with_tokens(tokens.iter().copied());
    Arc::new(Node::new(Uuid::new_v4(), info, NodeState::Up, None))
}

/// A cluster of [mock_node]s, in the given order, with no keyspaces.
pub(crate) fn mock_cluster_state(nodes: &[(u8, &str, &[i64])]) -> ClusterState {
    let nodes = nodes
        .iter()
        .map(|(last_octet, datacenter, tokens)| mock_node(*last_octet, datacenter, tokens))
        .collect();
    ClusterState::new(nodes, HashMap::new())
}
