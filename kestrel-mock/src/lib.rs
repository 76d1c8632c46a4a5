//! A scriptable in-process CQL node for testing drivers.
//!
//! Each [MockNode] listens on its own loopback address and answers the
//! handshake, REGISTER and QUERY requests on its own. [RequestRule]s let a
//! test override that: forge errors, delay or swallow answers, drop
//! connections, or just observe what the driver sent.

mod actions;
mod errors;
mod frame;
mod node;

pub use actions::{
    example_db_errors, Action, Condition, FrameProcessor, Reaction, RequestReaction, RequestRule,
};
pub use errors::{DoorkeeperError, MockError, WorkerError};
pub use frame::{RequestFrame, RequestOpcode, ResponseFrame, ResponseOpcode};
pub use node::{
    get_exclusive_local_address, MockCluster, MockNode, MockNodeBuilder, RunningMockCluster,
    RunningNode,
};

#[cfg(test)]
pub(crate) fn setup_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let testing_layer = tracing_subscriber::fmt::layer()
        .with_test_writer()
        .with_filter(tracing_subscriber::EnvFilter::from_default_env());
    let noop_layer = tracing_subscriber::fmt::layer().with_writer(std::io::sink);
    let _ = tracing_subscriber::registry()
        .with(testing_layer)
        .with(noop_layer)
        .try_init();
}
