use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use kestrel::client::SessionBuilder;
use kestrel::cluster::{NodeInfo, TopologyEvent};
use kestrel::errors::{ExecutionError, NewSessionError};
use kestrel::statement::Statement;
use kestrel_mock::{get_exclusive_local_address, MockCluster};

use crate::utils::{close, connect, ordered_profile, setup_tracing};

#[tokio::test]
#[ntest::timeout(30000)]
async fn results_can_be_waited_for_without_a_runtime() {
    setup_tracing();
    let cluster = MockCluster::with_nodes(2).run().await.unwrap();
    let session = Arc::new(connect(&cluster.addresses(), ordered_profile().build()).await);

    let waiting_session = session.clone();
    let (blocking, timed) = tokio::task::spawn_blocking(move || {
        let blocking = waiting_session.execute("SELECT * FROM ks.t").wait();
        let timed = waiting_session
            .execute("SELECT * FROM ks.t")
            .wait_timeout(Duration::from_secs(5));
        (blocking, timed)
    })
    .await
    .unwrap();
    assert!(blocking.is_ok());
    assert_matches!(timed, Ok(Ok(_)));

    let session = Arc::try_unwrap(session).unwrap();
    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn closed_session_rejects_requests() {
    setup_tracing();
    let cluster = MockCluster::with_nodes(1).run().await.unwrap();
    let session = Arc::new(connect(&cluster.addresses(), ordered_profile().build()).await);

    let closing = session.clone();
    tokio::task::spawn_blocking(move || {
        closing.close().unwrap();
        // Closing twice is harmless.
        closing.close().unwrap();
    })
    .await
    .unwrap();

    assert_matches!(
        session.execute("SELECT * FROM ks.t").await,
        Err(ExecutionError::SessionClosed)
    );
    assert_matches!(
        session
            .handle_topology_event(TopologyEvent::Down(cluster.addresses()[0]))
            .await,
        Err(ExecutionError::SessionClosed)
    );

    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn down_nodes_leave_the_plans_until_they_are_up() {
    setup_tracing();
    let cluster = MockCluster::with_nodes(2).run().await.unwrap();
    let addresses = cluster.addresses();
    let session = connect(&addresses, ordered_profile().build()).await;

    let coordinator = |result: kestrel::QueryResult| result.request_coordinator().node().address;
    let select = || Statement::new("SELECT * FROM ks.t");

    assert_eq!(coordinator(session.execute(select()).await.unwrap()), addresses[0]);

    session
        .handle_topology_event(TopologyEvent::Down(addresses[0]))
        .await
        .unwrap();
    assert_eq!(coordinator(session.execute(select()).await.unwrap()), addresses[1]);

    session
        .handle_topology_event(TopologyEvent::Up(addresses[0]))
        .await
        .unwrap();
    assert_eq!(coordinator(session.execute(select()).await.unwrap()), addresses[0]);

    session
        .handle_topology_event(TopologyEvent::Removed(addresses[0]))
        .await
        .unwrap();
    assert_eq!(session.get_cluster_state().get_nodes_info().len(), 1);
    assert_eq!(coordinator(session.execute(select()).await.unwrap()), addresses[1]);

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn added_nodes_get_a_pool_and_take_requests() {
    setup_tracing();
    let cluster = MockCluster::with_nodes(2).run().await.unwrap();
    let addresses = cluster.addresses();
    let session = connect(&addresses[..1], ordered_profile().build()).await;

    session
        .handle_topology_event(TopologyEvent::Down(addresses[0]))
        .await
        .unwrap();
    session
        .handle_topology_event(TopologyEvent::Added(NodeInfo::new(addresses[1])))
        .await
        .unwrap();

    let result = session.execute("SELECT * FROM ks.t").await.unwrap();
    assert_eq!(result.request_coordinator().node().address, addresses[1]);
    assert!(cluster.running_nodes[1].connections_accepted() > 0);

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn unreachable_known_nodes_fail_the_connect() {
    setup_tracing();
    // Nothing listens there.
    let address = SocketAddr::new(get_exclusive_local_address(), 9042);
    let result = SessionBuilder::new()
        .known_node(address)
        .connect_timeout(Duration::from_millis(500))
        .build()
        .await;
    assert_matches!(result, Err(NewSessionError::FailedToConnect(_)));
}
