use kestrel_cql::Consistency;
use tracing::debug;

use super::{RequestInfo, RetryDecision, RetryPolicy};
use crate::errors::{DbError, RequestAttemptError, WriteType};

/// Downgrading consistency retry policy - retries with lower consistency level if it knows\
/// that the initial CL is unreachable. Also, it behaves as [DefaultRetryPolicy](crate::policies::retry::DefaultRetryPolicy)
/// when it believes that the initial CL is reachable.
///
/// Like the default policy, timeouts and unavailability are retried at most once.
#[derive(Debug, Default, Clone, Copy)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    /// Creates a new instance of [DowngradingConsistencyRetryPolicy].
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

// The highest consistency level that `known_ok` replicas can satisfy.
fn max_likely_to_work_cl(known_ok: i32, previous_cl: Consistency) -> RetryDecision {
    let decision = if known_ok >= 3 {
        RetryDecision::RetrySameNode(Some(Consistency::Three))
    } else if known_ok == 2 {
        RetryDecision::RetrySameNode(Some(Consistency::Two))
    } else if known_ok == 1 || previous_cl == Consistency::EachQuorum {
        // EACH_QUORUM does not report a global number of alive replicas,
        // so even with 0 alive replicas there might be a node up in another datacenter.
        RetryDecision::RetrySameNode(Some(Consistency::One))
    } else {
        RetryDecision::DontRetry
    };
    if let RetryDecision::RetrySameNode(new_cl) = decision {
        debug!(
            "Decided to lower required consistency from {} to {:?}.",
            previous_cl, new_cl
        );
    }
    decision
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn decide_should_retry(&self, request_info: RequestInfo) -> RetryDecision {
        let cl = request_info.consistency;
        let first_retry = request_info.retry_count == 0;

        if cl.is_serial() {
            return match request_info.error {
                // The operation failed at the paxos phase of a LWT.
                // Retry on the next node, the coordinator could be network-isolated.
                RequestAttemptError::DbError(DbError::Unavailable { .. }, _) if first_retry => {
                    RetryDecision::RetryNextNode(None)
                }
                _ => RetryDecision::DontRetry,
            };
        }

        match request_info.error {
            // With connection broken, we don't know if request was executed.
            RequestAttemptError::BrokenConnectionError(_) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            RequestAttemptError::NoStreamsAvailable => RetryDecision::RetryNextNode(None),
            RequestAttemptError::DbError(db_error, _) => match db_error {
                // Basic errors - there are some problems on this node
                // Retry on a different one if possible
                DbError::Overloaded | DbError::ServerError | DbError::TruncateError => {
                    if request_info.is_idempotent {
                        RetryDecision::RetryNextNode(None)
                    } else {
                        RetryDecision::DontRetry
                    }
                }
                // Unavailable - the current node believes that not enough nodes
                // are alive to satisfy specified consistency requirements.
                DbError::Unavailable { alive, .. } => {
                    if first_retry {
                        max_likely_to_work_cl(*alive, cl)
                    } else {
                        RetryDecision::DontRetry
                    }
                }
                // ReadTimeout - coordinator didn't receive enough replies in time.
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                } => {
                    if !first_retry {
                        RetryDecision::DontRetry
                    } else if received < required {
                        max_likely_to_work_cl(*received, cl)
                    } else if !*data_present {
                        RetryDecision::RetrySameNode(None)
                    } else {
                        RetryDecision::DontRetry
                    }
                }
                // Write timeout - coordinator didn't receive enough replies in time.
                DbError::WriteTimeout {
                    write_type,
                    received,
                    ..
                } => {
                    if !first_retry || !request_info.is_idempotent {
                        RetryDecision::DontRetry
                    } else {
                        match write_type {
                            // At least one replica persisted the write.
                            WriteType::Batch | WriteType::Simple if *received > 0 => {
                                RetryDecision::IgnoreWriteError
                            }
                            // Since only part of the batch could have been persisted,
                            // retry with whatever consistency should allow to persist all
                            WriteType::UnloggedBatch => max_likely_to_work_cl(*received, cl),
                            WriteType::BatchLog => RetryDecision::RetrySameNode(None),
                            _ => RetryDecision::DontRetry,
                        }
                    }
                }
                // The node is still bootstrapping it can't execute the request, we should try another one
                DbError::IsBootstrapping => RetryDecision::RetryNextNode(None),
                // In all other cases propagate the error to the user
                _ => RetryDecision::DontRetry,
            },
            _ => RetryDecision::DontRetry,
        }
    }

    fn name(&self) -> String {
        "DowngradingConsistencyRetryPolicy".to_string()
    }
}
