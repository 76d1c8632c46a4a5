use kestrel_cql::frame::response::error::{DbError, WriteType};

use crate::errors::RequestAttemptError;

use super::{RequestInfo, RetryDecision, RetryPolicy};

/// Default retry policy - retries when there is a high chance that a retry might help.\
/// Timeouts and unavailability are retried at most once per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    /// Creates a new instance of [DefaultRetryPolicy].
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide_should_retry(&self, request_info: RequestInfo) -> RetryDecision {
        if request_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        };
        let first_retry = request_info.retry_count == 0;
        match request_info.error {
            // Basic errors - there are some problems on this node
            // Retry on a different one if possible
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::DbError(DbError::Overloaded, _)
            | RequestAttemptError::DbError(DbError::ServerError, _)
            | RequestAttemptError::DbError(DbError::TruncateError, _) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Unavailable - the current node believes that not enough nodes
            // are alive to satisfy specified consistency requirements.
            // Maybe this node has network problems - try a different one.
            RequestAttemptError::DbError(DbError::Unavailable { .. }, _) => {
                if first_retry {
                    RetryDecision::RetryNextNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // ReadTimeout - coordinator didn't receive enough replies in time.
            // Retry only if there were actually enough replies
            // to satisfy consistency but they were all just checksums (data_present == false).
            RequestAttemptError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                if first_retry && received >= required && !*data_present {
                    RetryDecision::RetrySameNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Write timeout - coordinator didn't receive enough replies in time.
            // Retry only for BatchLog write: by the time we retry,
            // the coordinator should have detected the dead nodes.
            RequestAttemptError::DbError(DbError::WriteTimeout { write_type, .. }, _) => {
                if first_retry && request_info.is_idempotent && *write_type == WriteType::BatchLog
                {
                    RetryDecision::RetrySameNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The node is still bootstrapping it can't execute the request, we should try another one
            RequestAttemptError::DbError(DbError::IsBootstrapping, _) => {
                RetryDecision::RetryNextNode(None)
            }
            // Connection to the contacted node is overloaded, try another one
            RequestAttemptError::NoStreamsAvailable => RetryDecision::RetryNextNode(None),
            // In all other cases propagate the error to the user
            _ => RetryDecision::DontRetry,
        }
    }

    fn name(&self) -> String {
        "DefaultRetryPolicy".to_string()
    }
}
