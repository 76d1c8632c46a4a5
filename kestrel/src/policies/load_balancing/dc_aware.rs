use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use itertools::Itertools;
use tracing::{debug, warn};

use super::{rotated, FallbackPlan, LoadBalancingPolicy, NodeDistance, RoutingInfo};
use crate::cluster::{ClusterState, NodeRef};

/// Round-robin over the nodes of the local datacenter first,
/// then over a bounded number of nodes of each remote datacenter.
///
/// The local datacenter is either set with the builder, or taken from the first
/// node of the initial cluster state that has a datacenter.
/// Remote datacenters are skipped for datacenter-local consistencies
/// (`LocalOne`, `LocalQuorum`) unless explicitly allowed.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    settings: DcAwareRoundRobinPolicyBuilder,
    local_dc: OnceLock<String>,
    used_hosts_per_remote_dc: usize,
    allow_remote_dcs_for_local_consistency: bool,
    index: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    /// Creates a builder used to customise configuration of a new DcAwareRoundRobinPolicy.
    pub fn builder() -> DcAwareRoundRobinPolicyBuilder {
        DcAwareRoundRobinPolicyBuilder::new()
    }

    /// The local datacenter, once known.
    pub fn local_dc(&self) -> Option<&str> {
        self.local_dc.get().map(String::as_str)
    }

    fn is_local(&self, node: NodeRef<'_>) -> bool {
        match (self.local_dc.get(), &node.datacenter) {
            (Some(local_dc), Some(dc)) => local_dc == dc,
            // Without datacenter information every node counts as local.
            _ => true,
        }
    }

    fn remote_nodes<'a>(
        &'a self,
        request: &RoutingInfo,
        cluster: &'a ClusterState,
        start: usize,
    ) -> Vec<NodeRef<'a>> {
        if self.used_hosts_per_remote_dc == 0 {
            return Vec::new();
        }
        if request.consistency.is_dc_local() && !self.allow_remote_dcs_for_local_consistency {
            return Vec::new();
        }
        let Some(local_dc) = self.local_dc.get() else {
            return Vec::new();
        };

        cluster
            .get_datacenters_info()
            .iter()
            .filter(|(dc, _)| *dc != local_dc)
            .sorted_unstable_by(|(a, _), (b, _)| a.cmp(b))
            .flat_map(|(_, nodes)| {
                rotated(nodes, start)
                    .filter(|node| node.is_up())
                    .take(self.used_hosts_per_remote_dc)
            })
            .collect()
    }

    fn nodes_from<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
        start: usize,
    ) -> FallbackPlan<'a> {
        let local_nodes = match self.local_dc.get() {
            Some(local_dc) => cluster
                .get_datacenters_info()
                .get(local_dc)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            None => cluster.get_nodes_info(),
        };
        let local = rotated(local_nodes, start).filter(|node| node.is_up());

        // Remote nodes are only computed once the local ones run out.
        let remote = std::iter::once(())
            .flat_map(move |()| self.remote_nodes(request, cluster, start));

        Box::new(local.chain(remote))
    }
}

impl Default for DcAwareRoundRobinPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn init(&self, cluster: &ClusterState) {
        if self.local_dc.get().is_some() {
            return;
        }
        match cluster
            .get_nodes_info()
            .iter()
            .find_map(|node| node.datacenter.clone())
        {
            Some(dc) => {
                debug!("Using '{}' as the local datacenter", dc);
                let _ = self.local_dc.set(dc);
            }
            None => warn!(
                "No known node has a datacenter; every node is treated as local by {}",
                self.name()
            ),
        }
    }

    fn new_instance(&self) -> Option<Arc<dyn LoadBalancingPolicy>> {
        // A discovered datacenter is discovered again by the copy.
        Some(Arc::new(self.settings.clone().build()))
    }

    fn distance(&self, node: NodeRef<'_>, _cluster: &ClusterState) -> NodeDistance {
        if self.is_local(node) {
            NodeDistance::Local
        } else if self.used_hosts_per_remote_dc > 0 {
            NodeDistance::Remote
        } else {
            NodeDistance::Ignored
        }
    }

    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        let start = self.index.fetch_add(1, Ordering::Relaxed);
        self.nodes_from(request, cluster, start).next()
    }

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        // Continues the rotation of the latest pick.
        let start = self.index.load(Ordering::Relaxed).wrapping_sub(1);
        self.nodes_from(request, cluster, start)
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}

/// The builder of [DcAwareRoundRobinPolicy].
#[derive(Debug, Clone, Default)]
pub struct DcAwareRoundRobinPolicyBuilder {
    local_dc: Option<String>,
    used_hosts_per_remote_dc: usize,
    allow_remote_dcs_for_local_consistency: bool,
}

impl DcAwareRoundRobinPolicyBuilder {
    /// Creates a builder with the local datacenter to be discovered, and no remote nodes used.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local datacenter instead of discovering it.
    pub fn local_dc(mut self, local_dc: impl Into<String>) -> Self {
        self.local_dc = Some(local_dc.into());
        self
    }

    /// How many Up nodes of each remote datacenter are appended to plans.
    pub fn used_hosts_per_remote_dc(mut self, used_hosts_per_remote_dc: usize) -> Self {
        self.used_hosts_per_remote_dc = used_hosts_per_remote_dc;
        self
    }

    /// Whether remote nodes are used for `LocalOne` and `LocalQuorum` requests too.
    pub fn allow_remote_dcs_for_local_consistency(mut self, allow: bool) -> Self {
        self.allow_remote_dcs_for_local_consistency = allow;
        self
    }

    /// Builds the policy.
    pub fn build(self) -> DcAwareRoundRobinPolicy {
        let local_dc = OnceLock::new();
        if let Some(dc) = &self.local_dc {
            let _ = local_dc.set(dc.clone());
        }
        DcAwareRoundRobinPolicy {
            local_dc,
            used_hosts_per_remote_dc: self.used_hosts_per_remote_dc,
            allow_remote_dcs_for_local_consistency: self.allow_remote_dcs_for_local_consistency,
            index: AtomicUsize::new(0),
            settings: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use kestrel_cql::Consistency;

    use super::DcAwareRoundRobinPolicy;
    use crate::cluster::{ClusterState, NodeState};
    use crate::policies::load_balancing::{LoadBalancingPolicy, NodeDistance, Plan, RoutingInfo};
    use crate::utils::test_utils::{mock_cluster_state, setup_tracing};

    fn three_dcs() -> ClusterState {
        mock_cluster_state(&[
            (1, "eu", &[]),
            (2, "us", &[]),
            (3, "eu", &[]),
            (4, "asia", &[]),
            (5, "us", &[]),
            (6, "eu", &[]),
        ])
    }

    fn plan_dcs(policy: &DcAwareRoundRobinPolicy, info: &RoutingInfo, state: &ClusterState) -> Vec<String> {
        Plan::new(policy, info, state)
            .map(|node| node.datacenter.clone().unwrap())
            .collect()
    }

    #[test]
    fn local_dc_is_discovered_from_first_node() {
        setup_tracing();
        let state = three_dcs();
        let policy = DcAwareRoundRobinPolicy::default();
        assert_eq!(policy.local_dc(), None);
        policy.init(&state);
        assert_eq!(policy.local_dc(), Some("eu"));

        let explicit = DcAwareRoundRobinPolicy::builder().local_dc("us").build();
        explicit.init(&state);
        assert_eq!(explicit.local_dc(), Some("us"));
    }

    #[test]
    fn local_nodes_come_before_remote_ones() {
        setup_tracing();
        let state = three_dcs();
        let policy = DcAwareRoundRobinPolicy::builder()
            .used_hosts_per_remote_dc(1)
            .build();
        policy.init(&state);
        let info = RoutingInfo {
            consistency: Consistency::Quorum,
            ..Default::default()
        };

        for _ in 0..10 {
            let dcs = plan_dcs(&policy, &info, &state);
            // All three local nodes, then one node of each remote dc, sorted by name.
            assert_eq!(dcs, vec!["eu", "eu", "eu", "asia", "us"]);
        }
    }

    #[test]
    fn local_nodes_rotate() {
        setup_tracing();
        let state = three_dcs();
        let policy = DcAwareRoundRobinPolicy::default();
        policy.init(&state);
        let info = RoutingInfo::default();

        let firsts: Vec<_> = (0..3)
            .map(|_| Plan::new(&policy, &info, &state).next().unwrap().address)
            .collect();
        assert_ne!(firsts[0], firsts[1]);
        assert_ne!(firsts[1], firsts[2]);
        assert_ne!(firsts[0], firsts[2]);
    }

    #[test]
    fn plans_going_past_the_first_node_keep_the_rotation_fair() {
        setup_tracing();
        let state = mock_cluster_state(&[
            (1, "eu", &[]),
            (2, "eu", &[]),
            (3, "us", &[]),
            (4, "eu", &[]),
            (5, "eu", &[]),
        ]);
        let policy = DcAwareRoundRobinPolicy::builder()
            .used_hosts_per_remote_dc(1)
            .build();
        policy.init(&state);
        let info = RoutingInfo {
            consistency: Consistency::Quorum,
            ..Default::default()
        };

        let mut first_places: HashMap<_, usize> = HashMap::new();
        for _ in 0..1000 {
            let mut plan = Plan::new(&policy, &info, &state);
            let first = plan.next().unwrap();
            let second = plan.next().unwrap();
            assert!(!Arc::ptr_eq(first, second));
            assert_eq!(first.datacenter.as_deref(), Some("eu"));
            *first_places.entry(first.host_id).or_default() += 1;
        }

        assert_eq!(first_places.len(), 4, "{first_places:?}");
        assert!(first_places.values().all(|count| *count == 250));
    }

    #[test]
    fn local_consistency_stays_local_unless_allowed() {
        setup_tracing();
        let state = three_dcs();
        let info = RoutingInfo {
            consistency: Consistency::LocalQuorum,
            ..Default::default()
        };

        let strict = DcAwareRoundRobinPolicy::builder()
            .used_hosts_per_remote_dc(2)
            .build();
        strict.init(&state);
        assert_eq!(plan_dcs(&strict, &info, &state), vec!["eu", "eu", "eu"]);

        let relaxed = DcAwareRoundRobinPolicy::builder()
            .used_hosts_per_remote_dc(2)
            .allow_remote_dcs_for_local_consistency(true)
            .build();
        relaxed.init(&state);
        assert_eq!(plan_dcs(&relaxed, &info, &state).len(), 6);
    }

    #[test]
    fn down_local_nodes_fall_back_to_remote() {
        setup_tracing();
        let state = three_dcs();
        let policy = DcAwareRoundRobinPolicy::builder()
            .used_hosts_per_remote_dc(1)
            .build();
        policy.init(&state);
        for node in state.get_datacenters_info()["eu"].iter() {
            node.set_state(NodeState::Down);
        }
        let info = RoutingInfo {
            consistency: Consistency::One,
            ..Default::default()
        };
        assert_eq!(plan_dcs(&policy, &info, &state), vec!["asia", "us"]);
    }

    #[test]
    fn remote_nodes_are_ignored_without_remote_hosts() {
        setup_tracing();
        let state = three_dcs();
        let policy = DcAwareRoundRobinPolicy::default();
        policy.init(&state);
        let nodes = state.get_nodes_info();
        assert_eq!(policy.distance(&nodes[0], &state), NodeDistance::Local);
        assert_eq!(policy.distance(&nodes[1], &state), NodeDistance::Ignored);

        let with_remote = DcAwareRoundRobinPolicy::builder()
            .local_dc("eu")
            .used_hosts_per_remote_dc(1)
            .build();
        assert_eq!(with_remote.distance(&nodes[1], &state), NodeDistance::Remote);
    }

    #[test]
    fn new_instance_rediscovers_the_local_dc() {
        setup_tracing();
        let eu_first = three_dcs();
        let policy = DcAwareRoundRobinPolicy::builder()
            .used_hosts_per_remote_dc(1)
            .build();
        policy.init(&eu_first);
        assert_eq!(policy.local_dc(), Some("eu"));

        let copy = policy.new_instance().unwrap();
        let us_first = mock_cluster_state(&[(2, "us", &[]), (1, "eu", &[])]);
        copy.init(&us_first);
        let info = RoutingInfo {
            consistency: Consistency::Quorum,
            ..Default::default()
        };
        let first = Plan::new(copy.as_ref(), &info, &us_first).next().unwrap();
        assert_eq!(first.datacenter.as_deref(), Some("us"));
        // The original keeps its own datacenter.
        assert_eq!(policy.local_dc(), Some("eu"));

        let explicit = DcAwareRoundRobinPolicy::builder().local_dc("asia").build();
        let copy = explicit.new_instance().unwrap();
        copy.init(&us_first);
        assert_eq!(copy.name(), explicit.name());
    }
}
