//! Speculative execution mechanism allows the driver to send speculative requests to
//! multiple nodes in the cluster when the current node takes too long to respond.
//!
//! Only idempotent requests are executed speculatively. The first attempt that
//! finishes with a result the caller should see wins; the results of the other
//! attempts are discarded, the attempts themselves are not aborted on the wire.

use std::future::Future;
use std::time::Duration;

use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{trace_span, Instrument};

use crate::errors::{DbError, ExecutionError, RequestAttemptError};

/// The policy that decides if the driver will send speculative requests to the
/// next nodes when the current node takes too long to respond.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// The maximum number of speculative executions that will be triggered
    /// for a given request (does not include the initial request)
    fn max_speculative_executions(&self) -> usize;

    /// The delay between each speculative execution
    fn delay(&self) -> Duration;

    /// Returns the name of the policy.
    fn name(&self) -> String;
}

/// Never executes speculatively.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSpeculativeExecutionPolicy;

impl SpeculativeExecutionPolicy for NoSpeculativeExecutionPolicy {
    fn max_speculative_executions(&self) -> usize {
        0
    }

    fn delay(&self) -> Duration {
        Duration::MAX
    }

    fn name(&self) -> String {
        "NoSpeculativeExecutionPolicy".to_string()
    }
}

/// A [`SpeculativeExecutionPolicy`] that schedules a given number of speculative
/// executions, separated by a fixed delay.
#[derive(Debug, Clone)]
pub struct ConstantSpeculativeExecutionPolicy {
    /// The maximum number of speculative executions that will be triggered
    /// for a given request (does not include the initial request)
    pub max_speculative_executions: usize,

    /// The delay between each speculative execution
    pub delay: Duration,
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn max_speculative_executions(&self) -> usize {
        self.max_speculative_executions
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    fn name(&self) -> String {
        format!(
            "ConstantSpeculativeExecutionPolicy(delay: {:?}, max: {})",
            self.delay, self.max_speculative_executions
        )
    }
}

// Errors that say something about the node, not about the request:
// another node may well succeed.
fn db_error_is_node_specific(error: &DbError) -> bool {
    matches!(
        error,
        DbError::Unavailable { .. }
            | DbError::Overloaded
            | DbError::IsBootstrapping
            | DbError::TruncateError
            | DbError::ReadTimeout { .. }
            | DbError::WriteTimeout { .. }
            | DbError::ReadFailure { .. }
            | DbError::WriteFailure { .. }
            | DbError::ServerError
    )
}

/// Checks if a result created in a speculative execution branch can be ignored.
///
/// We should ignore errors such that their presence when executing the request
/// on one node, does not imply that the same error will appear during retry on some other node.
pub(crate) fn can_be_ignored<ResT>(result: &Result<ResT, ExecutionError>) -> bool {
    match result {
        Ok(_) => false,
        Err(e) => match e {
            ExecutionError::NoHostsAvailable
            | ExecutionError::RequestTimeout(_)
            | ExecutionError::ProfileError(_)
            | ExecutionError::ReactorError(_)
            | ExecutionError::SessionClosed => false,

            // Can try on another node.
            ExecutionError::ConnectionPoolError { .. } => true,

            ExecutionError::LastAttemptError(e) => match e {
                // Errors that will almost certainly appear for other nodes as well
                RequestAttemptError::CqlRequestSerialization(_)
                | RequestAttemptError::BodyExtensionsParseError(_)
                | RequestAttemptError::CqlResponseParseError(_)
                | RequestAttemptError::UnexpectedResponse(_)
                | RequestAttemptError::RepreparedIdChanged { .. } => false,

                RequestAttemptError::BrokenConnectionError(_)
                | RequestAttemptError::NoStreamsAvailable => true,

                RequestAttemptError::DbError(db_error, _) => db_error_is_node_specific(db_error),
            },
        },
    }
}

/// Runs the fibers produced by `fiber_generator`, starting a new one every
/// `policy.delay()` until `policy.max_speculative_executions()` extra fibers run.
///
/// The generator gets the fiber's index (0 for the original execution).
/// A fiber yields `None` when the query plan ran out: no fiber is started after that.
/// The first result that cannot be ignored is returned; if every fiber ends with
/// an ignorable error, the last one is returned.
pub(crate) async fn execute<FiberFut, ResT>(
    policy: &dyn SpeculativeExecutionPolicy,
    mut fiber_generator: impl FnMut(usize) -> FiberFut,
) -> Result<ResT, ExecutionError>
where
    FiberFut: Future<Output = Option<Result<ResT, ExecutionError>>>,
{
    let mut executions_remaining = policy.max_speculative_executions();
    let delay = policy.delay();
    let mut next_fiber_id = 0;

    let mut async_tasks = FuturesUnordered::new();
    async_tasks.push(
        fiber_generator(next_fiber_id)
            .instrument(trace_span!("Speculative execution: original request")),
    );
    next_fiber_id += 1;

    let sleep = tokio::time::sleep(delay).fuse();
    tokio::pin!(sleep);

    let mut last_error = None;
    loop {
        futures::select! {
            _ = &mut sleep => {
                if executions_remaining > 0 {
                    async_tasks.push(
                        fiber_generator(next_fiber_id)
                            .instrument(trace_span!("Speculative execution", fiber_id = next_fiber_id)),
                    );
                    next_fiber_id += 1;
                    executions_remaining -= 1;

                    // reset the timeout
                    sleep.set(tokio::time::sleep(delay).fuse());
                }
            }
            res = async_tasks.select_next_some() => {
                if let Some(r) = res {
                    if !can_be_ignored(&r) {
                        return r;
                    } else {
                        last_error = Some(r)
                    }
                } else {
                    // The plan is exhausted, there is no reason to start any more fibers.
                    // The ones still running may yet succeed.
                    executions_remaining = 0;
                }
                if async_tasks.is_empty() && executions_remaining == 0 {
                    return last_error.unwrap_or(Err(ExecutionError::NoHostsAvailable));
                }
            }
        }
    }
}
