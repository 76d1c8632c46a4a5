use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use kestrel::client::{ExecutionProfile, SessionBuilder};
use kestrel::errors::{ExecutionError, ProfileError};
use kestrel::policies::retry::FallthroughRetryPolicy;
use kestrel::statement::{Consistency, Statement};
use kestrel_cql::frame::request::Request;
use kestrel_mock::{Condition, MockCluster, MockNode, Reaction, RequestReaction, RequestRule};
use tokio::sync::mpsc;

use crate::utils::{close, connect, ordered_profile, setup_tracing};

fn consistency_of(frame: kestrel_mock::RequestFrame) -> Consistency {
    match frame.deserialize() {
        Ok(Some(Request::Query(query))) => query.parameters.consistency,
        other => panic!("Expected a QUERY frame, got {:?}", other),
    }
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn consistency_is_resolved_statement_first() {
    setup_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cluster = MockCluster::new([MockNode::builder()
        .request_rules(vec![RequestRule::observe(
            Condition::query_contains("SELECT"),
            tx,
        )])
        .build()])
    .run()
    .await
    .unwrap();

    let default = ordered_profile().consistency(Consistency::Two).build();
    let session = SessionBuilder::new()
        .known_nodes(cluster.addresses())
        .default_execution_profile(default)
        .execution_profile(
            "olap",
            ExecutionProfile::builder()
                .consistency(Consistency::All)
                .build(),
        )
        .execution_profile("empty", ExecutionProfile::default())
        .build()
        .await
        .unwrap();

    let statement = Statement::new("SELECT * FROM ks.t");

    session.execute(statement.clone()).await.unwrap();
    assert_eq!(consistency_of(rx.recv().await.unwrap()), Consistency::Two);

    session
        .execute(statement.clone().with_execution_profile("olap"))
        .await
        .unwrap();
    assert_eq!(consistency_of(rx.recv().await.unwrap()), Consistency::All);

    // A profile without a consistency takes the default profile's.
    session
        .execute(statement.clone().with_execution_profile("empty"))
        .await
        .unwrap();
    assert_eq!(consistency_of(rx.recv().await.unwrap()), Consistency::Two);

    session
        .execute(
            statement
                .with_execution_profile("olap")
                .with_consistency(Consistency::Quorum),
        )
        .await
        .unwrap();
    assert_eq!(consistency_of(rx.recv().await.unwrap()), Consistency::Quorum);

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn unknown_profile_fails_the_request() {
    setup_tracing();
    let cluster = MockCluster::with_nodes(1).run().await.unwrap();
    let session = connect(&cluster.addresses(), ordered_profile().build()).await;

    let result = session
        .execute(Statement::new("SELECT * FROM ks.t").with_execution_profile("missing"))
        .await;
    assert_matches!(
        result,
        Err(ExecutionError::ProfileError(ProfileError::UnknownProfile(name))) if name == "missing"
    );

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn profiles_without_retry_policy_share_the_default_one() {
    setup_tracing();
    let cluster = MockCluster::with_nodes(1).run().await.unwrap();
    let session = SessionBuilder::new()
        .known_nodes(cluster.addresses())
        .default_execution_profile(
            ordered_profile()
                .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
                .build(),
        )
        .execution_profile("inherits", ExecutionProfile::default())
        .execution_profile(
            "own",
            ExecutionProfile::builder()
                .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
                .build(),
        )
        .build()
        .await
        .unwrap();

    let default_retry = session.get_default_execution_profile_handle().retry_policy();
    let inherited = session
        .get_execution_profile_handle("inherits")
        .unwrap()
        .retry_policy();
    let own = session
        .get_execution_profile_handle("own")
        .unwrap()
        .retry_policy();
    assert!(Arc::ptr_eq(&default_retry, &inherited));
    assert!(!Arc::ptr_eq(&default_retry, &own));

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn remapped_handle_applies_to_later_requests() {
    setup_tracing();
    let cluster = MockCluster::new([MockNode::builder()
        .request_rules(vec![RequestRule(
            Condition::query_contains("SELECT"),
            RequestReaction::drop_frame(),
        )])
        .build()])
    .run()
    .await
    .unwrap();
    let session = connect(&cluster.addresses(), ordered_profile().build()).await;

    let handle = session.get_default_execution_profile_handle().clone();
    let statement = Statement::new("SELECT * FROM ks.t");
    let timeout = Duration::from_millis(200);
    handle.map_to_another_profile(
        handle
            .pointee_to_builder()
            .request_timeout(Some(timeout))
            .build(),
    );
    assert_eq!(handle.request_timeout(), Some(timeout));

    assert_matches!(
        session.execute(statement).await,
        Err(ExecutionError::RequestTimeout(t)) if t == timeout
    );

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn statement_handle_takes_precedence_over_the_default() {
    setup_tracing();
    let cluster = MockCluster::new([MockNode::builder()
        .request_rules(vec![RequestRule(
            Condition::query_contains("SELECT"),
            RequestReaction::drop_frame(),
        )])
        .build()])
    .run()
    .await
    .unwrap();
    let timeout = Duration::from_millis(150);
    let session = SessionBuilder::new()
        .known_nodes(cluster.addresses())
        .default_execution_profile(ordered_profile().build())
        .execution_profile(
            "impatient",
            ExecutionProfile::builder()
                .request_timeout(Some(timeout))
                .build(),
        )
        .build()
        .await
        .unwrap();

    let mut statement = Statement::new("SELECT * FROM ks.t");
    statement.set_execution_profile_handle(session.get_execution_profile_handle("impatient").cloned());
    assert_matches!(
        session.execute(statement).await,
        Err(ExecutionError::RequestTimeout(t)) if t == timeout
    );

    close(session).await;
    cluster.finish().await.unwrap();
}
