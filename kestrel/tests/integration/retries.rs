use std::sync::Arc;

use assert_matches::assert_matches;
use kestrel::errors::{DbError, ExecutionError, RequestAttemptError};
use kestrel::observability::history::AttemptResult;
use kestrel::policies::retry::{FallthroughRetryPolicy, RetryDecision};
use kestrel::statement::Statement;
use kestrel_mock::{
    example_db_errors, Condition, MockCluster, MockNode, Reaction, RequestReaction, RequestRule,
};

use crate::utils::{close, connect, ordered_profile, setup_tracing, NextNodeOnWriteTimeout};

fn write_timeout_on_inserts() -> RequestRule {
    RequestRule(
        Condition::query_contains("INSERT"),
        RequestReaction::forge_with_error(example_db_errors::write_timeout()),
    )
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn write_timeouts_move_on_to_the_next_node() {
    setup_tracing();
    let cluster = MockCluster::new([
        MockNode::builder()
            .request_rules(vec![write_timeout_on_inserts()])
            .build(),
        MockNode::builder()
            .request_rules(vec![write_timeout_on_inserts()])
            .build(),
        MockNode::builder().build(),
    ])
    .run()
    .await
    .unwrap();
    let addresses = cluster.addresses();

    let profile = ordered_profile()
        .retry_policy(Arc::new(NextNodeOnWriteTimeout))
        .build();
    let session = connect(&addresses, profile).await;

    let result = session
        .execute("INSERT INTO ks.t (a) VALUES (1)")
        .await
        .unwrap();
    assert_eq!(result.request_coordinator().node().address, addresses[2]);

    let history = result.history().unwrap();
    assert_eq!(history.attempted_hosts(), addresses);
    let attempts = history.attempts();
    for failed in &attempts[..2] {
        assert_matches!(
            &failed.result,
            Some(AttemptResult::Error(
                _,
                RequestAttemptError::DbError(DbError::WriteTimeout { .. }, _),
                RetryDecision::RetryNextNode(None)
            ))
        );
    }
    assert_matches!(attempts[2].result, Some(AttemptResult::Success(_)));
    assert!(history.speculative_fibers.is_empty());

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn exhausted_plan_reports_the_last_error() {
    setup_tracing();
    let cluster = MockCluster::new([
        MockNode::builder()
            .request_rules(vec![write_timeout_on_inserts()])
            .build(),
        MockNode::builder()
            .request_rules(vec![RequestRule(
                Condition::query_contains("INSERT"),
                RequestReaction::forge_with_error(example_db_errors::overloaded()),
            )])
            .build(),
    ])
    .run()
    .await
    .unwrap();
    let addresses = cluster.addresses();

    let profile = ordered_profile()
        .retry_policy(Arc::new(NextNodeOnWriteTimeout))
        .build();
    let session = connect(&addresses, profile).await;

    let mut future = session.execute("INSERT INTO ks.t (a) VALUES (1)");
    assert_matches!(
        (&mut future).await,
        Err(ExecutionError::LastAttemptError(RequestAttemptError::DbError(
            DbError::Overloaded,
            _
        )))
    );
    let history = future.history().unwrap();
    assert_eq!(history.attempted_hosts(), addresses);

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn fallthrough_policy_never_retries() {
    setup_tracing();
    let cluster = MockCluster::new([
        MockNode::builder()
            .request_rules(vec![write_timeout_on_inserts()])
            .build(),
        MockNode::builder().build(),
    ])
    .run()
    .await
    .unwrap();
    let addresses = cluster.addresses();

    let profile = ordered_profile()
        .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
        .build();
    let session = connect(&addresses, profile).await;

    let statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)").with_idempotence(true);
    let mut future = session.execute(statement);
    assert_matches!(
        (&mut future).await,
        Err(ExecutionError::LastAttemptError(RequestAttemptError::DbError(
            DbError::WriteTimeout { .. },
            _
        )))
    );
    assert_eq!(future.history().unwrap().attempted_hosts(), &addresses[..1]);

    close(session).await;
    cluster.finish().await.unwrap();
}
