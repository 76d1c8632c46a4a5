use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{rotated, FallbackPlan, LoadBalancingPolicy, RoutingInfo};
use crate::cluster::{ClusterState, NodeRef};

/// Spreads requests evenly over all Up nodes, ignoring datacenters.
///
/// Each plan starts one node further along the list of nodes than the previous one.
/// The start only moves in [LoadBalancingPolicy::pick]; the fallback of a plan
/// continues the rotation of the latest pick, so plans that go past their first
/// node do not skip anybody's turn.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates a new instance of [RoundRobinPolicy].
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes_from<'a>(
        &'a self,
        cluster: &'a ClusterState,
        start: usize,
    ) -> impl Iterator<Item = NodeRef<'a>> + Send + Sync + 'a {
        rotated(cluster.get_nodes_info(), start).filter(|node| node.is_up())
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn new_instance(&self) -> Option<Arc<dyn LoadBalancingPolicy>> {
        Some(Arc::new(RoundRobinPolicy::new()))
    }

    fn pick<'a>(
        &'a self,
        _request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        let start = self.index.fetch_add(1, Ordering::Relaxed);
        self.nodes_from(cluster, start).next()
    }

    fn fallback<'a>(
        &'a self,
        _request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        let start = self.index.load(Ordering::Relaxed).wrapping_sub(1);
        Box::new(self.nodes_from(cluster, start))
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::RoundRobinPolicy;
    use crate::cluster::NodeState;
    use crate::policies::load_balancing::{Plan, RoutingInfo};
    use crate::utils::test_utils::{mock_cluster_state, setup_tracing};

    #[test]
    fn plans_rotate_over_all_nodes() {
        setup_tracing();
        let state = mock_cluster_state(&[(1, "dc1", &[]), (2, "dc2", &[]), (3, "dc1", &[])]);
        let policy = RoundRobinPolicy::new();
        let info = RoutingInfo::default();

        let addresses = |plan: Plan<'_>| plan.map(|node| node.address.ip()).collect::<Vec<_>>();
        let first = addresses(Plan::new(&policy, &info, &state));
        let second = addresses(Plan::new(&policy, &info, &state));
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn first_places_are_spread_evenly() {
        setup_tracing();
        let state = mock_cluster_state(&[
            (1, "dc1", &[]),
            (2, "dc1", &[]),
            (3, "dc1", &[]),
            (4, "dc1", &[]),
            (5, "dc1", &[]),
        ]);
        let policy = RoundRobinPolicy::new();
        let info = RoutingInfo::default();

        const PLANS: usize = 10_003;
        let nodes = state.get_nodes_info().len();
        let mut first_places: HashMap<_, usize> = HashMap::new();
        for _ in 0..PLANS {
            let first = Plan::new(&policy, &info, &state).next().unwrap();
            *first_places.entry(first.host_id).or_default() += 1;
        }

        assert_eq!(first_places.len(), nodes);
        let mean = PLANS / nodes;
        for count in first_places.values() {
            assert!(count.abs_diff(mean) <= 1, "{first_places:?}");
        }
    }

    #[test]
    fn plans_going_past_the_first_node_keep_the_rotation_fair() {
        setup_tracing();
        let state = mock_cluster_state(&[
            (1, "dc1", &[]),
            (2, "dc1", &[]),
            (3, "dc1", &[]),
            (4, "dc1", &[]),
        ]);
        let policy = RoundRobinPolicy::new();
        let info = RoutingInfo::default();

        let mut first_places: HashMap<_, usize> = HashMap::new();
        for _ in 0..1000 {
            let mut plan = Plan::new(&policy, &info, &state);
            let first = plan.next().unwrap();
            // A retry on the next node pulls the fallback.
            let second = plan.next().unwrap();
            assert!(!Arc::ptr_eq(first, second));
            *first_places.entry(first.host_id).or_default() += 1;
        }

        assert_eq!(first_places.len(), 4, "{first_places:?}");
        assert!(first_places.values().all(|count| *count == 250));
    }

    #[test]
    fn down_nodes_are_skipped() {
        setup_tracing();
        let state = mock_cluster_state(&[(1, "dc1", &[]), (2, "dc1", &[]), (3, "dc1", &[])]);
        let down = state.get_nodes_info()[1].clone();
        down.set_state(NodeState::Down);

        let policy = RoundRobinPolicy::new();
        let info = RoutingInfo::default();
        for _ in 0..6 {
            let plan: Vec<_> = Plan::new(&policy, &info, &state).collect();
            assert_eq!(plan.len(), 2);
            assert!(plan.iter().all(|node| !Arc::ptr_eq(node, &down)));
        }
    }
}
