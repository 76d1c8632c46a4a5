//! This module holds entities that represent the cluster as a whole,
//! nodes in the cluster (together with a pool of connections),
//! and the cluster's state.
//!
//! This includes:
//! - node's representation ([Node]),
//! - [ClusterState], which is a snapshot of the cluster's state.
//!   - [ClusterState] is replaced atomically upon a topology change,
//!     preventing any issues arising from mutability, including races.
//! - [TopologyEvent]s, which change the cluster's state.
//   The cluster worker applies them, keeps the control connection alive
//   and refills pools that lost their connections.

mod worker;
pub(crate) use worker::{Cluster, ClusterConfig};
pub use worker::TopologyEvent;

mod state;
pub use state::ClusterState;

pub(crate) mod node;
pub use node::{Node, NodeInfo, NodeRef, NodeState};
