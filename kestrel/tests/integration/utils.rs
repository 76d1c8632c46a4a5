use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kestrel::client::{ExecutionProfile, Session, SessionBuilder};
use kestrel::cluster::ClusterState;
use kestrel::errors::{DbError, RequestAttemptError};
use kestrel::policies::load_balancing::{FallbackPlan, LoadBalancingPolicy, RoutingInfo};
use kestrel::policies::retry::{RequestInfo, RetryDecision, RetryPolicy};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Plans list the Up nodes in the order they were given to the session.
#[derive(Debug)]
pub(crate) struct KnownNodesOrderPolicy;

impl LoadBalancingPolicy for KnownNodesOrderPolicy {
    fn fallback<'a>(
        &'a self,
        _request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        Box::new(cluster.get_nodes_info().iter().filter(|node| node.is_up()))
    }

    fn name(&self) -> String {
        "KnownNodesOrderPolicy".to_string()
    }
}

/// Moves on to the next node after a write timeout; gives up on anything else.
#[derive(Debug)]
pub(crate) struct NextNodeOnWriteTimeout;

impl RetryPolicy for NextNodeOnWriteTimeout {
    fn decide_should_retry(&self, request_info: RequestInfo) -> RetryDecision {
        match request_info.error {
            RequestAttemptError::DbError(DbError::WriteTimeout { .. }, _) => {
                RetryDecision::RetryNextNode(None)
            }
            _ => RetryDecision::DontRetry,
        }
    }

    fn name(&self) -> String {
        "NextNodeOnWriteTimeout".to_string()
    }
}

/// A profile whose plans follow the known nodes' order.
pub(crate) fn ordered_profile() -> kestrel::client::ExecutionProfileBuilder {
    ExecutionProfile::builder()
        .load_balancing_policy(Arc::new(KnownNodesOrderPolicy))
        .token_aware_routing(false)
        .request_timeout(Some(Duration::from_secs(5)))
}

pub(crate) async fn connect(addresses: &[SocketAddr], profile: ExecutionProfile) -> Session {
    SessionBuilder::new()
        .known_nodes(addresses.iter().copied())
        .default_execution_profile(profile)
        .connect_timeout(Duration::from_secs(2))
        .build()
        .await
        .unwrap()
}

/// Closes the session off the async runtime, since closing joins the reactor threads.
pub(crate) async fn close(session: Session) {
    tokio::task::spawn_blocking(move || session.close())
        .await
        .unwrap()
        .unwrap();
}
