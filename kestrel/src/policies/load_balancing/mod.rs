//! Load balancing configurations\
//! `Session` can use any load balancing policy which implements the `LoadBalancingPolicy` trait.
//!
//! The provided policies are composed by wrapping: [TokenAwarePolicy], [LatencyAwarePolicy]
//! and [HostFilterPolicy] each hold a child policy and refine the plan it produces,
//! while [RoundRobinPolicy] and [DcAwareRoundRobinPolicy] produce plans on their own.

use std::sync::Arc;
use std::time::Duration;

use kestrel_cql::{Consistency, SerialConsistency};

use crate::cluster::{ClusterState, NodeRef};
use crate::errors::RequestAttemptError;
use crate::routing::Token;

mod dc_aware;
mod host_filter;
mod latency_aware;
mod plan;
mod round_robin;
mod token_aware;

pub use dc_aware::{DcAwareRoundRobinPolicy, DcAwareRoundRobinPolicyBuilder};
pub use host_filter::{HostFilter, HostFilterPolicy};
pub use latency_aware::{LatencyAwarePolicy, LatencyAwarenessBuilder};
pub use plan::Plan;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// Represents info about statement that can be used by load balancing policies.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    /// Requested consistency information allows to route requests to the appropriate
    /// datacenters. E.g. requests with a LOCAL_ONE consistency should be routed to the same
    /// datacenter.
    pub consistency: Consistency,
    /// Serial consistency of the request, if any.
    pub serial_consistency: Option<SerialConsistency>,

    /// Token and keyspace are the basis of token-aware routing.
    pub token: Option<Token>,
    /// Keyspace the request operates on.
    pub keyspace: Option<&'a str>,
}

/// How the driver should treat a node: whether to keep connections to it,
/// and how eagerly to use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeDistance {
    /// Preferred for requests; connections are kept.
    Local,
    /// Used when local nodes fail; connections are kept.
    Remote,
    /// Never used; no connections are opened.
    Ignored,
}

/// The fallback list of nodes in the request plan.
///
/// It is computed on-demand, only if querying the most preferred node fails
/// (or when speculative execution is triggered).
pub type FallbackPlan<'a> = Box<dyn Iterator<Item = NodeRef<'a>> + Send + Sync + 'a>;

/// Policy that decides which nodes to contact for each request.
///
/// When a request is prepared to be sent, a `LoadBalancingPolicy`
/// implementation constructs a load balancing plan. That plan is a list of
/// nodes to which the driver will try to send the request. The first elements of the plan
/// are the nodes which are the best to contact (e.g. they might have the lowest latency).
///
/// Most requests are sent on the first try, so the request execution layer rarely needs to know more
/// than one node from plan. To better optimize that case, `LoadBalancingPolicy` has two methods:
/// `pick` and `fallback`. `pick` returns the first node to contact for a given request, `fallback`
/// returns the rest of the load balancing plan.
///
/// `fallback` is called not only if a send to `pick`ed node failed (or when executing
/// speculatively), but also if `pick` returns `None`.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Called with the initial cluster state, before the first plan is requested.
    ///
    /// A policy shared by several execution profiles is initialised once per profile,
    /// so implementations must tolerate repeated calls.
    fn init(&self, _cluster: &ClusterState) {}

    /// A fresh, uninitialised policy with the same settings, used when a session
    /// configuration is copied deeply. `None` means the policy is shared between copies.
    fn new_instance(&self) -> Option<Arc<dyn LoadBalancingPolicy>> {
        None
    }

    /// How the driver should treat `node`. Nodes `Ignored` by every policy get no connection pool.
    fn distance(&self, _node: NodeRef<'_>, _cluster: &ClusterState) -> NodeDistance {
        NodeDistance::Local
    }

    /// Returns the first node to contact for a given request.
    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        self.fallback(request, cluster).next()
    }

    /// Returns all contact-appropriate nodes for a given request.
    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a>;

    /// Invoked each time a request succeeds.
    fn on_request_success(&self, _request: &RoutingInfo, _latency: Duration, _node: NodeRef<'_>) {}

    /// Invoked each time a request fails.
    fn on_request_failure(
        &self,
        _request: &RoutingInfo,
        _latency: Duration,
        _node: NodeRef<'_>,
        _error: &RequestAttemptError,
    ) {
    }

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

// Iterates over `nodes` starting at `start` (modulo the length), wrapping around once.
pub(crate) fn rotated<T>(nodes: &[T], start: usize) -> impl Iterator<Item = &T> + Clone {
    let len = nodes.len();
    let start = if len == 0 { 0 } else { start % len };
    nodes[start..].iter().chain(nodes[..start].iter())
}

#[cfg(test)]
mod tests {
    use super::rotated;

    #[test]
    fn rotation_wraps_around_once() {
        let nodes = [1, 2, 3, 4];
        assert_eq!(rotated(&nodes, 0).copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(rotated(&nodes, 2).copied().collect::<Vec<_>>(), vec![3, 4, 1, 2]);
        assert_eq!(rotated(&nodes, 9).copied().collect::<Vec<_>>(), vec![2, 3, 4, 1]);
        assert_eq!(rotated::<i32>(&[], 7).count(), 0);
    }
}
