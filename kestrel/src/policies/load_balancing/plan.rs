use tracing::error;

use super::{FallbackPlan, LoadBalancingPolicy, NodeRef, RoutingInfo};
use crate::cluster::ClusterState;

enum PlanState<'a> {
    Fresh,
    Exhausted,
    Picked(NodeRef<'a>),
    Falling {
        rest: FallbackPlan<'a>,
        picked: Option<NodeRef<'a>>,
    },
}

/// The ordered, finite sequence of nodes a request may be sent to.
///
/// Only the first node is computed up front, through [LoadBalancingPolicy::pick].
/// The rest comes from [LoadBalancingPolicy::fallback] once the first node
/// has been consumed, with the picked node filtered out, so the common case
/// where the first node answers never builds the full list.
///
/// When the plan runs out, the request has no hosts left to try.
pub struct Plan<'a> {
    policy: &'a dyn LoadBalancingPolicy,
    routing_info: &'a RoutingInfo<'a>,
    cluster: &'a ClusterState,

    state: PlanState<'a>,
}

impl<'a> Plan<'a> {
    /// Creates a plan of `policy` for the request described by `routing_info`.
    pub fn new(
        policy: &'a dyn LoadBalancingPolicy,
        routing_info: &'a RoutingInfo<'a>,
        cluster: &'a ClusterState,
    ) -> Self {
        Self {
            policy,
            routing_info,
            cluster,
            state: PlanState::Fresh,
        }
    }

    fn fall_back(&mut self, picked: Option<NodeRef<'a>>) -> Option<NodeRef<'a>> {
        let rest = self.policy.fallback(self.routing_info, self.cluster);
        self.state = PlanState::Falling { rest, picked };
        self.next()
    }
}

impl<'a> Iterator for Plan<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            PlanState::Fresh => match self.policy.pick(self.routing_info, self.cluster) {
                Some(picked) => {
                    self.state = PlanState::Picked(picked);
                    Some(picked)
                }
                // No cheap first node; the fallback may still have some.
                None => {
                    let first = self.fall_back(None);
                    if first.is_none() {
                        error!(
                            policy = %self.policy.name(),
                            routing_info = ?self.routing_info,
                            "Load balancing policy produced an empty plan"
                        );
                        self.state = PlanState::Exhausted;
                    }
                    first
                }
            },
            PlanState::Picked(picked) => {
                let picked = *picked;
                self.fall_back(Some(picked))
            }
            PlanState::Falling { rest, picked } => {
                let picked = *picked;
                rest.find(|node| Some(*node) != picked)
            }
            PlanState::Exhausted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::Node;
    use crate::utils::test_utils::{mock_cluster_state, mock_node, setup_tracing};

    #[derive(Debug)]
    struct PickingNonePolicy {
        expected_nodes: Vec<Arc<Node>>,
    }
    impl LoadBalancingPolicy for PickingNonePolicy {
        fn pick<'a>(
            &'a self,
            _query: &'a RoutingInfo,
            _cluster: &'a ClusterState,
        ) -> Option<NodeRef<'a>> {
            None
        }

        fn fallback<'a>(
            &'a self,
            _query: &'a RoutingInfo,
            _cluster: &'a ClusterState,
        ) -> FallbackPlan<'a> {
            Box::new(self.expected_nodes.iter())
        }

        fn name(&self) -> String {
            "PickingNone".into()
        }
    }

    #[test]
    fn plan_calls_fallback_even_if_pick_returned_none() {
        setup_tracing();
        let policy = PickingNonePolicy {
            expected_nodes: vec![mock_node(1, "dc1", &[]), mock_node(2, "dc1", &[])],
        };
        let cluster_state = mock_cluster_state(&[]);
        let routing_info = RoutingInfo::default();
        let plan = Plan::new(&policy, &routing_info, &cluster_state);
        assert_eq!(plan.cloned().collect::<Vec<_>>(), policy.expected_nodes);
    }

    // Picks the second node, then falls back to all of them.
    #[derive(Debug)]
    struct PickingSecondPolicy;
    impl LoadBalancingPolicy for PickingSecondPolicy {
        fn pick<'a>(
            &'a self,
            _query: &'a RoutingInfo,
            cluster: &'a ClusterState,
        ) -> Option<NodeRef<'a>> {
            cluster.get_nodes_info().get(1)
        }

        fn fallback<'a>(
            &'a self,
            _query: &'a RoutingInfo,
            cluster: &'a ClusterState,
        ) -> FallbackPlan<'a> {
            Box::new(cluster.get_nodes_info().iter())
        }

        fn name(&self) -> String {
            "PickingSecond".into()
        }
    }

    #[test]
    fn picked_node_is_not_repeated_by_fallback() {
        setup_tracing();
        let cluster_state = mock_cluster_state(&[(1, "dc1", &[]), (2, "dc1", &[]), (3, "dc1", &[])]);
        let routing_info = RoutingInfo::default();
        let plan = Plan::new(&PickingSecondPolicy, &routing_info, &cluster_state);
        let nodes = cluster_state.get_nodes_info();
        assert_eq!(
            plan.cloned().collect::<Vec<_>>(),
            vec![nodes[1].clone(), nodes[0].clone(), nodes[2].clone()]
        );
    }

    #[derive(Debug)]
    struct EmptyPolicy;
    impl LoadBalancingPolicy for EmptyPolicy {
        fn fallback<'a>(
            &'a self,
            _query: &'a RoutingInfo,
            _cluster: &'a ClusterState,
        ) -> FallbackPlan<'a> {
            Box::new(std::iter::empty())
        }

        fn name(&self) -> String {
            "Empty".into()
        }
    }

    #[test]
    fn empty_plan_stays_empty() {
        setup_tracing();
        let cluster_state = mock_cluster_state(&[(1, "dc1", &[])]);
        let routing_info = RoutingInfo::default();
        let mut plan = Plan::new(&EmptyPolicy, &routing_info, &cluster_state);
        assert!(plan.next().is_none());
        assert!(plan.next().is_none());
    }
}
