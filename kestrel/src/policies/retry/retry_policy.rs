//! Request retries configurations\
//! To decide when to retry a request the `Session` can use any object which implements
//! the `RetryPolicy` trait

use crate::errors::RequestAttemptError;
use kestrel_cql::Consistency;

/// Information about a failed request
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// The error with which the request failed
    pub error: &'a RequestAttemptError,
    /// A request is idempotent if it can be applied multiple times without changing the result of the initial application\
    /// If set to `true` we can be sure that it is idempotent\
    /// If set to `false` it is unknown whether it is idempotent
    pub is_idempotent: bool,
    /// Consistency with which the request failed
    pub consistency: Consistency,
    /// How many times the request was already retried, across all nodes.
    pub retry_count: u32,
}

/// What the request execution should do after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again to the same node.
    RetrySameNode(Option<Consistency>), // None means that the same consistency should be used as before
    /// Move on to the next node of the query plan.
    RetryNextNode(Option<Consistency>), // ditto
    /// Return the error to the caller.
    DontRetry,
    /// Treat the failed write as a success with an empty result.
    IgnoreWriteError,
}

impl RetryDecision {
    /// Whether another attempt follows.
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            RetryDecision::RetrySameNode(_) | RetryDecision::RetryNextNode(_)
        )
    }
}

/// Specifies a policy used to decide when to retry a request
///
/// The decision depends on nothing but the [RequestInfo] passed in:
/// the same information always yields the same decision.
/// Policies keep no per-request state; the request execution counts retries for them.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called after the request failed - decide what to do next
    fn decide_should_retry(&self, request_info: RequestInfo) -> RetryDecision;

    /// Returns the name of the retry policy.
    fn name(&self) -> String;
}
