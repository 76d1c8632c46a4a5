use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use kestrel::errors::ExecutionError;
use kestrel::policies::retry::FallthroughRetryPolicy;
use kestrel::policies::speculative_execution::ConstantSpeculativeExecutionPolicy;
use kestrel::statement::Statement;
use kestrel_mock::{
    example_db_errors, Condition, MockCluster, MockNode, Reaction, RequestReaction, RequestRule,
};

use crate::utils::{close, connect, ordered_profile, setup_tracing};

fn speculative_profile(request_timeout: Duration) -> kestrel::client::ExecutionProfile {
    ordered_profile()
        .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
        .speculative_execution_policy(Arc::new(ConstantSpeculativeExecutionPolicy {
            max_speculative_executions: 1,
            delay: Duration::from_millis(50),
        }))
        .request_timeout(Some(request_timeout))
        .build()
}

fn insert() -> Statement {
    Statement::new("INSERT INTO ks.t (a) VALUES (1)")
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn speculative_fiber_wins_over_a_hanging_node() {
    setup_tracing();
    let cluster = MockCluster::new([
        MockNode::builder()
            .request_rules(vec![RequestRule(
                Condition::query_contains("INSERT"),
                RequestReaction::drop_frame(),
            )])
            .build(),
        MockNode::builder().build(),
    ])
    .run()
    .await
    .unwrap();
    let addresses = cluster.addresses();
    let session = connect(&addresses, speculative_profile(Duration::from_secs(5))).await;

    let result = session
        .execute(insert().with_idempotence(true))
        .await
        .unwrap();
    assert_eq!(result.request_coordinator().node().address, addresses[1]);

    let history = result.history().unwrap();
    assert_eq!(history.attempted_hosts(), addresses);
    assert_eq!(history.speculative_fibers.len(), 1);
    assert!(history.non_speculative_fiber.attempts[0].result.is_none());

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn late_response_of_the_slow_node_is_discarded() {
    setup_tracing();
    let cluster = MockCluster::new([
        MockNode::builder()
            .request_rules(vec![RequestRule(
                Condition::query_contains("INSERT"),
                RequestReaction::forge_with_error_delayed(
                    example_db_errors::overloaded(),
                    Duration::from_millis(500),
                ),
            )])
            .build(),
        MockNode::builder().build(),
    ])
    .run()
    .await
    .unwrap();
    let addresses = cluster.addresses();
    let session = connect(&addresses, speculative_profile(Duration::from_secs(5))).await;

    let mut future = session.execute(insert().with_idempotence(true));
    let result = (&mut future).await.unwrap();
    assert_eq!(result.request_coordinator().node().address, addresses[1]);

    // The overloaded answer arrives after the request completed and changes nothing.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(future.history().is_some());
    let second = session
        .execute(Statement::new("SELECT * FROM ks.t"))
        .await
        .unwrap();
    assert_eq!(second.request_coordinator().node().address, addresses[0]);

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn non_idempotent_statements_do_not_speculate() {
    setup_tracing();
    let cluster = MockCluster::new([
        MockNode::builder()
            .request_rules(vec![RequestRule(
                Condition::query_contains("INSERT"),
                RequestReaction::drop_frame(),
            )])
            .build(),
        MockNode::builder().build(),
    ])
    .run()
    .await
    .unwrap();
    let addresses = cluster.addresses();
    let timeout = Duration::from_millis(300);
    let session = connect(&addresses, speculative_profile(timeout)).await;

    let mut future = session.execute(insert());
    assert_matches!(
        (&mut future).await,
        Err(ExecutionError::RequestTimeout(t)) if t == timeout
    );
    let history = future.history().unwrap();
    assert_eq!(history.attempted_hosts(), &addresses[..1]);
    assert!(history.speculative_fibers.is_empty());

    close(session).await;
    cluster.finish().await.unwrap();
}
