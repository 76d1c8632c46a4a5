use std::sync::Arc;

use tracing::info;

use super::{RequestInfo, RetryDecision, RetryPolicy};

/// Wraps another retry policy and logs every decision to retry or ignore an error.
///
/// Decisions are those of the wrapped policy; `DontRetry` is not logged.
#[derive(Debug, Clone)]
pub struct LoggingRetryPolicy {
    child: Arc<dyn RetryPolicy>,
}

impl LoggingRetryPolicy {
    /// Creates a new instance of [LoggingRetryPolicy] wrapping `child`.
    pub fn new(child: Arc<dyn RetryPolicy>) -> LoggingRetryPolicy {
        LoggingRetryPolicy { child }
    }
}

impl RetryPolicy for LoggingRetryPolicy {
    fn decide_should_retry(&self, request_info: RequestInfo) -> RetryDecision {
        let decision = self.child.decide_should_retry(request_info);
        match &decision {
            RetryDecision::RetrySameNode(new_cl) | RetryDecision::RetryNextNode(new_cl) => {
                info!(
                    error = %request_info.error,
                    retries = request_info.retry_count,
                    "Retrying ({:?}) at consistency {} (initial consistency: {})",
                    decision,
                    new_cl.unwrap_or(request_info.consistency),
                    request_info.consistency,
                );
            }
            RetryDecision::IgnoreWriteError => {
                info!(
                    error = %request_info.error,
                    retries = request_info.retry_count,
                    "Ignoring error (initial consistency: {})",
                    request_info.consistency,
                );
            }
            RetryDecision::DontRetry => {}
        }
        decision
    }

    fn name(&self) -> String {
        format!("LoggingRetryPolicy({})", self.child.name())
    }
}
