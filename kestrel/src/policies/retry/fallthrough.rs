use super::{RequestInfo, RetryDecision, RetryPolicy};

/// Forwards all errors directly to the user, never retries
#[derive(Debug, Default, Clone, Copy)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    /// Creates a new instance of [FallthroughRetryPolicy].
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn decide_should_retry(&self, _request_info: RequestInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn name(&self) -> String {
        "FallthroughRetryPolicy".to_string()
    }
}
