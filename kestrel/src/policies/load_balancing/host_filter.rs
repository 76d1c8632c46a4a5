//! Host filters.
//!
//! A host filter is a predicate over nodes. Nodes it rejects never appear in the plans of
//! a [HostFilterPolicy] and are reported as [NodeDistance::Ignored], so the session does not
//! open connections to them.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{FallbackPlan, LoadBalancingPolicy, NodeDistance, RoutingInfo};
use crate::cluster::{ClusterState, Node, NodeRef};
use crate::errors::RequestAttemptError;

/// Which nodes a [HostFilterPolicy] accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFilter {
    /// Accepts only nodes with one of these addresses.
    Whitelist(Vec<IpAddr>),
    /// Accepts every node except the ones with these addresses.
    Blacklist(Vec<IpAddr>),
    /// Accepts only nodes from these datacenters.
    DcWhitelist(Vec<String>),
    /// Accepts every node except the ones from these datacenters.
    DcBlacklist(Vec<String>),
}

impl HostFilter {
    /// Returns whether `node` passes the filter.
    pub fn accept(&self, node: &Node) -> bool {
        let in_dcs = |dcs: &[String]| {
            node.datacenter
                .as_ref()
                .is_some_and(|dc| dcs.iter().any(|allowed| allowed == dc))
        };
        match self {
            HostFilter::Whitelist(ips) => ips.contains(&node.address.ip()),
            HostFilter::Blacklist(ips) => !ips.contains(&node.address.ip()),
            HostFilter::DcWhitelist(dcs) => in_dcs(dcs),
            HostFilter::DcBlacklist(dcs) => !in_dcs(dcs),
        }
    }
}

/// Wraps a child policy and drops the nodes rejected by a [HostFilter] from its plans.
#[derive(Debug)]
pub struct HostFilterPolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    filter: HostFilter,
}

impl HostFilterPolicy {
    /// Filters the plans of `child` with `filter`.
    pub fn new(child: Arc<dyn LoadBalancingPolicy>, filter: HostFilter) -> Self {
        HostFilterPolicy { child, filter }
    }

    /// The filter in use.
    pub fn filter(&self) -> &HostFilter {
        &self.filter
    }
}

impl LoadBalancingPolicy for HostFilterPolicy {
    fn init(&self, cluster: &ClusterState) {
        self.child.init(cluster)
    }

    fn new_instance(&self) -> Option<Arc<dyn LoadBalancingPolicy>> {
        let child = self.child.new_instance()?;
        Some(Arc::new(HostFilterPolicy::new(child, self.filter.clone())))
    }

    fn distance(&self, node: NodeRef<'_>, cluster: &ClusterState) -> NodeDistance {
        if self.filter.accept(node) {
            self.child.distance(node, cluster)
        } else {
            NodeDistance::Ignored
        }
    }

    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        // A rejected pick is not final: the filtered fallback may still have nodes.
        self.child
            .pick(request, cluster)
            .filter(|node| self.filter.accept(node))
    }

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        Box::new(
            self.child
                .fallback(request, cluster)
                .filter(|node| self.filter.accept(node)),
        )
    }

    fn on_request_success(&self, request: &RoutingInfo, latency: Duration, node: NodeRef<'_>) {
        self.child.on_request_success(request, latency, node)
    }

    fn on_request_failure(
        &self,
        request: &RoutingInfo,
        latency: Duration,
        node: NodeRef<'_>,
        error: &RequestAttemptError,
    ) {
        self.child.on_request_failure(request, latency, node, error)
    }

    fn name(&self) -> String {
        format!("HostFilterPolicy({})", self.child.name())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use super::{HostFilter, HostFilterPolicy};
    use crate::policies::load_balancing::{
        LoadBalancingPolicy, NodeDistance, Plan, RoundRobinPolicy, RoutingInfo,
    };
    use crate::utils::test_utils::{mock_cluster_state, setup_tracing};

    fn ip(last_octet: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, last_octet))
    }

    #[test]
    fn filtered_nodes_never_appear() {
        setup_tracing();
        let state = mock_cluster_state(&[(1, "dc1", &[]), (2, "dc2", &[]), (3, "dc1", &[])]);
        let info = RoutingInfo::default();

        let cases = [
            (HostFilter::Whitelist(vec![ip(1), ip(2)]), vec![ip(1), ip(2)]),
            (HostFilter::Blacklist(vec![ip(1)]), vec![ip(2), ip(3)]),
            (HostFilter::DcWhitelist(vec!["dc1".into()]), vec![ip(1), ip(3)]),
            (HostFilter::DcBlacklist(vec!["dc1".into()]), vec![ip(2)]),
        ];
        for (filter, expected) in cases {
            let policy = HostFilterPolicy::new(Arc::new(RoundRobinPolicy::new()), filter);
            for _ in 0..3 {
                let mut plan: Vec<_> = Plan::new(&policy, &info, &state)
                    .map(|node| node.address.ip())
                    .collect();
                plan.sort_unstable();
                assert_eq!(plan, expected);
            }
        }
    }

    #[test]
    fn rejected_nodes_are_ignored() {
        setup_tracing();
        let state = mock_cluster_state(&[(1, "dc1", &[]), (2, "dc2", &[])]);
        let policy = HostFilterPolicy::new(
            Arc::new(RoundRobinPolicy::new()),
            HostFilter::DcWhitelist(vec!["dc2".into()]),
        );
        let nodes = state.get_nodes_info();
        assert_eq!(policy.distance(&nodes[0], &state), NodeDistance::Ignored);
        assert_eq!(policy.distance(&nodes[1], &state), NodeDistance::Local);
    }
}
