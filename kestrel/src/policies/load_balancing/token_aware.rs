use std::sync::Arc;
use std::time::Duration;

use rand::rng;
use rand::seq::SliceRandom;
use rand_pcg::Pcg32;

use super::{FallbackPlan, LoadBalancingPolicy, NodeDistance, RoutingInfo};
use crate::cluster::{ClusterState, NodeRef};
use crate::errors::RequestAttemptError;
use crate::routing::locator::ReplicaSet;

/// Puts the replicas owning the request's token first, then the rest of the child policy's plan.
///
/// Only replicas that are Up and that the child policy considers local are moved forward.
/// Requests without a token or keyspace get the child's plan unchanged.
#[derive(Debug)]
pub struct TokenAwarePolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    shuffle_replicas: bool,
    // Makes shuffling reproducible.
    fixed_seed: Option<u64>,
}

impl TokenAwarePolicy {
    /// Wraps `child`, shuffling the replicas of each plan.
    pub fn new(child: Arc<dyn LoadBalancingPolicy>) -> Self {
        TokenAwarePolicy {
            child,
            shuffle_replicas: true,
            fixed_seed: None,
        }
    }

    /// Sets whether replicas are shuffled. When they are not, they keep the ring order.
    pub fn with_replica_shuffle(mut self, shuffle_replicas: bool) -> Self {
        self.shuffle_replicas = shuffle_replicas;
        self
    }

    /// Shuffles replicas with a generator seeded with `seed`, so plans are reproducible.
    pub fn with_fixed_seed(mut self, seed: u64) -> Self {
        self.fixed_seed = Some(seed);
        self
    }

    /// The wrapped policy.
    pub fn child(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.child
    }

    fn replicas<'a>(&'a self, request: &RoutingInfo, cluster: &'a ClusterState) -> ReplicaSet<'a> {
        let (Some(token), Some(keyspace)) = (request.token, request.keyspace) else {
            return ReplicaSet::new();
        };
        let mut replicas: ReplicaSet<'a> = cluster
            .get_token_endpoints(keyspace, token)
            .into_iter()
            .filter(|node| {
                node.is_up() && self.child.distance(node, cluster) == NodeDistance::Local
            })
            .collect();

        if self.shuffle_replicas {
            match self.fixed_seed {
                Some(seed) => replicas.shuffle(&mut Pcg32::new(seed, 0)),
                None => replicas.shuffle(&mut rng()),
            }
        }
        replicas
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn init(&self, cluster: &ClusterState) {
        self.child.init(cluster)
    }

    fn new_instance(&self) -> Option<Arc<dyn LoadBalancingPolicy>> {
        let child = self.child.new_instance()?;
        Some(Arc::new(TokenAwarePolicy {
            child,
            shuffle_replicas: self.shuffle_replicas,
            fixed_seed: self.fixed_seed,
        }))
    }

    fn distance(&self, node: NodeRef<'_>, cluster: &ClusterState) -> NodeDistance {
        self.child.distance(node, cluster)
    }

    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        match self.replicas(request, cluster).first() {
            Some(replica) => Some(*replica),
            None => self.child.pick(request, cluster),
        }
    }

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        let replicas = self.replicas(request, cluster);
        if replicas.is_empty() {
            return self.child.fallback(request, cluster);
        }

        let excluded = replicas.clone();
        let rest = self
            .child
            .fallback(request, cluster)
            .filter(move |node| !excluded.iter().any(|replica| Arc::ptr_eq(replica, node)));
        Box::new(replicas.into_iter().chain(rest))
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
        format!("TokenAwarePolicy({})", self.child.name())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::TokenAwarePolicy;
    use crate::cluster::{ClusterState, NodeState};
    use crate::policies::load_balancing::{
        DcAwareRoundRobinPolicy, LoadBalancingPolicy, Plan, RoundRobinPolicy, RoutingInfo,
    };
    use crate::routing::locator::ReplicationStrategy;
    use crate::routing::Token;
    use crate::utils::test_utils::{mock_cluster_state, setup_tracing};

    // Ring: 100 -> .1, 200 -> .2, 300 -> .3, 400 -> .4
    fn ring_with_keyspace() -> ClusterState {
        let mut state = mock_cluster_state(&[
            (1, "dc1", &[100]),
            (2, "dc1", &[200]),
            (3, "dc2", &[300]),
            (4, "dc1", &[400]),
        ]);
        state.keyspaces = HashMap::from([(
            "ks".to_owned(),
            ReplicationStrategy::Simple {
                replication_factor: 2,
            },
        )]);
        state
    }

    fn last_octets(plan: Plan<'_>) -> Vec<u8> {
        plan.map(|node| match node.address.ip() {
            std::net::IpAddr::V4(ip) => ip.octets()[3],
            std::net::IpAddr::V6(_) => unreachable!(),
        })
        .collect()
    }

    fn unshuffled(child: Arc<dyn LoadBalancingPolicy>) -> TokenAwarePolicy {
        TokenAwarePolicy::new(child).with_replica_shuffle(false)
    }

    #[test]
    fn replicas_come_first() {
        setup_tracing();
        let state = ring_with_keyspace();
        let policy = unshuffled(Arc::new(RoundRobinPolicy::new()));
        let info = RoutingInfo {
            token: Some(Token::new(150)),
            keyspace: Some("ks"),
            ..Default::default()
        };

        for _ in 0..4 {
            let plan = last_octets(Plan::new(&policy, &info, &state));
            assert_eq!(&plan[..2], &[2, 3]);
            let mut rest = plan[2..].to_vec();
            rest.sort_unstable();
            assert_eq!(rest, vec![1, 4]);
        }
    }

    #[test]
    fn without_token_child_plan_is_used() {
        setup_tracing();
        let state = ring_with_keyspace();
        let policy = unshuffled(Arc::new(RoundRobinPolicy::new()));
        let no_token = RoutingInfo {
            keyspace: Some("ks"),
            ..Default::default()
        };
        assert_eq!(Plan::new(&policy, &no_token, &state).count(), 4);

        let unknown_keyspace = RoutingInfo {
            token: Some(Token::new(150)),
            keyspace: Some("other"),
            ..Default::default()
        };
        assert_eq!(Plan::new(&policy, &unknown_keyspace, &state).count(), 4);
    }

    #[test]
    fn remote_and_down_replicas_are_not_moved_forward() {
        setup_tracing();
        let state = ring_with_keyspace();
        let child = DcAwareRoundRobinPolicy::builder().local_dc("dc1").build();
        let policy = unshuffled(Arc::new(child));
        policy.init(&state);
        let info = RoutingInfo {
            token: Some(Token::new(250)),
            keyspace: Some("ks"),
            ..Default::default()
        };

        // Replicas of 250 are .3 (dc2, ignored by the child) and .4.
        let plan = last_octets(Plan::new(&policy, &info, &state));
        assert_eq!(plan[0], 4);
        assert!(!plan.contains(&3));

        state.get_nodes_info()[3].set_state(NodeState::Down);
        let plan = last_octets(Plan::new(&policy, &info, &state));
        assert!(!plan.contains(&4));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn shuffled_replicas_are_still_first() {
        setup_tracing();
        let state = ring_with_keyspace();
        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()));
        let info = RoutingInfo {
            token: Some(Token::new(350)),
            keyspace: Some("ks"),
            ..Default::default()
        };
        for _ in 0..10 {
            let plan = last_octets(Plan::new(&policy, &info, &state));
            let mut replicas = plan[..2].to_vec();
            replicas.sort_unstable();
            assert_eq!(replicas, vec![1, 4]);
            assert_eq!(plan.len(), 4);
        }
    }

    #[test]
    fn fixed_seed_gives_the_same_replica_order() {
        setup_tracing();
        let mut state = mock_cluster_state(&[
            (1, "dc1", &[100]),
            (2, "dc1", &[200]),
            (3, "dc1", &[300]),
            (4, "dc1", &[400]),
        ]);
        state.keyspaces = HashMap::from([(
            "ks".to_owned(),
            ReplicationStrategy::Simple {
                replication_factor: 4,
            },
        )]);
        let info = RoutingInfo {
            token: Some(Token::new(50)),
            keyspace: Some("ks"),
            ..Default::default()
        };
        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new())).with_fixed_seed(123);
        let first = last_octets(Plan::new(&policy, &info, &state));
        for _ in 0..5 {
            assert_eq!(last_octets(Plan::new(&policy, &info, &state)), first);
        }
    }

    #[test]
    fn new_instance_copies_the_whole_chain() {
        setup_tracing();
        let state = ring_with_keyspace();
        let policy = unshuffled(Arc::new(DcAwareRoundRobinPolicy::default()));
        policy.init(&state);

        let copy = policy.new_instance().unwrap();
        assert_eq!(copy.name(), policy.name());
        copy.init(&state);
        let info = RoutingInfo {
            token: Some(Token::new(150)),
            keyspace: Some("ks"),
            ..Default::default()
        };
        assert_eq!(
            &last_octets(Plan::new(copy.as_ref(), &info, &state))[..1],
            &last_octets(Plan::new(&policy, &info, &state))[..1]
        );
    }
}
