use assert_matches::assert_matches;
use kestrel::errors::{DbError, ExecutionError, RequestAttemptError};
use kestrel::observability::history::AttemptResult;
use kestrel::statement::Statement;
use kestrel_mock::{
    example_db_errors, Condition, MockCluster, MockNode, Reaction, RequestOpcode,
    RequestReaction, RequestRule,
};
use tokio::sync::mpsc;

use crate::utils::{close, connect, ordered_profile, setup_tracing};

const INSERT: &str = "INSERT INTO ks.t (a, b) VALUES (?, ?)";

#[tokio::test]
#[ntest::timeout(30000)]
async fn statements_are_prepared_on_every_node() {
    setup_tracing();
    let cluster = MockCluster::with_nodes(3).run().await.unwrap();
    let session = connect(&cluster.addresses(), ordered_profile().build()).await;

    let prepared = session.prepare(Statement::new(INSERT)).await.unwrap();
    let info = prepared.get_prepared().unwrap();
    assert_eq!(info.get_contents(), INSERT);
    for node in &cluster.running_nodes {
        assert_eq!(node.prepared_statements_count(), 1);
    }

    let result = session
        .execute(prepared.bind(&(1_i32, "one")).unwrap())
        .await
        .unwrap();
    assert_eq!(
        result.request_coordinator().node().address,
        cluster.addresses()[0]
    );

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn forgotten_statements_are_reprepared_transparently() {
    setup_tracing();
    let (prepare_tx, mut prepare_rx) = mpsc::unbounded_channel();
    let (execute_tx, mut execute_rx) = mpsc::unbounded_channel();
    let node = MockNode::builder()
        .request_rules(vec![
            RequestRule(
                Condition::RequestOpcode(RequestOpcode::Prepare),
                RequestReaction::noop().with_feedback_when_performed(prepare_tx),
            ),
            RequestRule(
                Condition::RequestOpcode(RequestOpcode::Execute),
                RequestReaction::noop().with_feedback_when_performed(execute_tx),
            ),
        ])
        .build();
    let cluster = MockCluster::new([node]).run().await.unwrap();
    let session = connect(&cluster.addresses(), ordered_profile().build()).await;

    let prepared = session.prepare(INSERT).await.unwrap();
    prepare_rx.recv().await.unwrap();

    cluster.running_nodes[0].forget_prepared_statements();
    let result = session
        .execute(prepared.bind(&(2_i32, "two")).unwrap())
        .await
        .unwrap();

    // One attempt: the UNPREPARED answer never reaches the retry policy.
    let history = result.history().unwrap();
    let attempts = history.attempts();
    assert_eq!(attempts.len(), 1);
    assert_matches!(attempts[0].result, Some(AttemptResult::Success(_)));

    let reprepare = prepare_rx.recv().await.unwrap();
    assert_eq!(reprepare.opcode, RequestOpcode::Prepare);
    for _ in 0..2 {
        let execute = execute_rx.recv().await.unwrap();
        assert_eq!(execute.opcode, RequestOpcode::Execute);
    }
    assert_eq!(cluster.running_nodes[0].prepared_statements_count(), 1);

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn prepare_fails_when_no_node_accepts_it() {
    setup_tracing();
    let reject_prepare = || {
        RequestRule(
            Condition::RequestOpcode(RequestOpcode::Prepare),
            RequestReaction::forge_with_error(example_db_errors::syntax_error()),
        )
    };
    let cluster = MockCluster::new([
        MockNode::builder()
            .request_rules(vec![reject_prepare()])
            .build(),
        MockNode::builder()
            .request_rules(vec![reject_prepare()])
            .build(),
    ])
    .run()
    .await
    .unwrap();
    let session = connect(&cluster.addresses(), ordered_profile().build()).await;

    let error = session.prepare("SELEKT nonsense").await.unwrap_err();
    assert_matches!(
        error,
        ExecutionError::LastAttemptError(RequestAttemptError::DbError(DbError::SyntaxError, _))
    );

    close(session).await;
    cluster.finish().await.unwrap();
}
