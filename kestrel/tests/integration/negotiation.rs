use std::time::Duration;

use assert_matches::assert_matches;
use kestrel::client::SessionBuilder;
use kestrel::errors::NewSessionError;
use kestrel::ProtocolVersion;
use kestrel_mock::{MockCluster, MockNode};

use crate::utils::{close, setup_tracing};

#[tokio::test]
#[ntest::timeout(30000)]
async fn session_steps_down_to_the_version_the_node_speaks() {
    setup_tracing();
    let cluster = MockCluster::new([MockNode::builder()
        .max_protocol_version(ProtocolVersion::V3)
        .build()])
    .run()
    .await
    .unwrap();

    let session = SessionBuilder::new()
        .known_nodes(cluster.addresses())
        .build()
        .await
        .unwrap();
    assert_eq!(session.protocol_version(), ProtocolVersion::V3);
    session.execute("SELECT * FROM ks.t").await.unwrap();

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn versions_above_the_highest_step_down_through_v5() {
    setup_tracing();
    let cluster = MockCluster::new([MockNode::builder().build()])
        .run()
        .await
        .unwrap();

    let session = SessionBuilder::new()
        .known_nodes(cluster.addresses())
        .protocol_version(ProtocolVersion::from_raw(0x07))
        .build()
        .await
        .unwrap();
    // The mock node speaks up to V4 by default.
    assert_eq!(session.protocol_version(), ProtocolVersion::V4);

    close(session).await;
    cluster.finish().await.unwrap();
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn starting_below_the_lowest_version_never_connects() {
    setup_tracing();
    let cluster = MockCluster::new([MockNode::builder().build()])
        .run()
        .await
        .unwrap();

    let result = SessionBuilder::new()
        .known_nodes(cluster.addresses())
        .protocol_version(ProtocolVersion::from_raw(0x02))
        .connect_timeout(Duration::from_secs(2))
        .build()
        .await;
    assert_matches!(result, Err(NewSessionError::InvalidConfig(_)));
    assert_eq!(cluster.running_nodes[0].connections_accepted(), 0);

    cluster.finish().await.unwrap();
}
