//! Collecting history of request executions: attempts, retries and speculative fibers.
//!
//! Every request executed by the session records its own history, which is
//! available from [`QueryResult::history`](crate::response::QueryResult::history)
//! and [`ResultFuture::history`](crate::client::ResultFuture::history).
//! Users who want to watch many requests at once can attach their own
//! [`HistoryListener`] to a [`Statement`](crate::statement::Statement).

use std::fmt::{Debug, Display};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::errors::{ExecutionError, RequestAttemptError};
use crate::policies::retry::RetryDecision;

/// Id of a single request, i.e. a single call to `Session::execute`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RequestId(pub usize);

/// Id of a single attempt within a request: one request frame sent on some connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AttemptId(pub usize);

/// Id of a speculative execution fiber.
///
/// With speculative execution enabled the driver runs several fibers per request,
/// each of them performing sequential attempts.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SpeculativeId(pub usize);

/// Receives request execution events.
///
/// The listener generates the ids of requests, attempts and fibers; the session
/// hands them back in later calls. Events may still arrive after a request
/// finished: they come from speculative fibers that did not notice it yet.
pub trait HistoryListener: Debug + Send + Sync {
    /// A request has started.
    fn log_request_start(&self) -> RequestId;

    /// The request completed successfully.
    fn log_request_success(&self, request_id: RequestId);

    /// The request failed; `error` is what the caller sees.
    fn log_request_error(&self, request_id: RequestId, error: &ExecutionError);

    /// A speculative fiber was started for the request.
    fn log_new_speculative_fiber(&self, request_id: RequestId) -> SpeculativeId;

    /// A request frame was sent to `node_addr`.
    fn log_attempt_start(
        &self,
        request_id: RequestId,
        speculative_id: Option<SpeculativeId>,
        node_addr: SocketAddr,
    ) -> AttemptId;

    /// The attempt got a successful response.
    fn log_attempt_success(&self, attempt_id: AttemptId);

    /// The attempt failed, and the retry policy decided what to do next.
    fn log_attempt_error(
        &self,
        attempt_id: AttemptId,
        error: &RequestAttemptError,
        retry_decision: &RetryDecision,
    );
}

pub type TimePoint = DateTime<Utc>;

fn now() -> TimePoint {
    SystemTime::now().into()
}

/// A [`HistoryListener`] that keeps everything it hears, already structured.
#[derive(Debug, Default)]
pub struct HistoryCollector {
    data: Mutex<CollectorData>,
}

#[derive(Debug, Default)]
struct CollectorData {
    history: StructuredHistory,
    // Indexed by SpeculativeId: (request, position among the request's speculative fibers).
    fibers: Vec<(RequestId, usize)>,
    // Indexed by AttemptId.
    attempts: Vec<Option<AttemptLocation>>,
}

#[derive(Debug, Clone, Copy)]
struct AttemptLocation {
    request: RequestId,
    fiber: Option<usize>,
    index: usize,
}

impl CollectorData {
    fn fiber_mut(&mut self, location: AttemptLocation) -> Option<&mut FiberHistory> {
        let request = self.history.requests.get_mut(location.request.0)?;
        match location.fiber {
            None => Some(&mut request.non_speculative_fiber),
            Some(i) => request.speculative_fibers.get_mut(i),
        }
    }

    fn attempt_mut(&mut self, attempt_id: AttemptId) -> Option<&mut AttemptHistory> {
        let location = (*self.attempts.get(attempt_id.0)?)?;
        self.fiber_mut(location)?.attempts.get_mut(location.index)
    }

    fn set_request_result(&mut self, request_id: RequestId, result: RequestHistoryResult) {
        match self.history.requests.get_mut(request_id.0) {
            Some(request) => request.result = Some(result),
            None => warn!("HistoryCollector - request {:?} was never started", request_id),
        }
    }
}

impl HistoryCollector {
    /// Creates a new collector with empty data.
    pub fn new() -> HistoryCollector {
        HistoryCollector::default()
    }

    /// Clones everything collected so far.
    pub fn clone_structured_history(&self) -> StructuredHistory {
        self.data().history.clone()
    }

    /// Takes the collected history out, leaving the collector empty.
    pub fn take_structured_history(&self) -> StructuredHistory {
        std::mem::take(&mut *self.data()).history
    }

    /// History of one request, if it was logged here.
    pub fn request_history(&self, request_id: RequestId) -> Option<RequestHistory> {
        self.data().history.requests.get(request_id.0).cloned()
    }

    // Collecting history must never bring a request down, so a poisoned lock is reused.
    fn data(&self) -> MutexGuard<'_, CollectorData> {
        self.data.lock().unwrap_or_else(|poisoned| {
            warn!("HistoryCollector - mutex poisoned, reusing its data");
            poisoned.into_inner()
        })
    }
}

impl HistoryListener for HistoryCollector {
    fn log_request_start(&self) -> RequestId {
        let mut data = self.data();
        let start_time = now();
        data.history.requests.push(RequestHistory {
            start_time,
            non_speculative_fiber: FiberHistory {
                start_time,
                attempts: Vec::new(),
            },
            speculative_fibers: Vec::new(),
            result: None,
        });
        RequestId(data.history.requests.len() - 1)
    }

    fn log_request_success(&self, request_id: RequestId) {
        self.data()
            .set_request_result(request_id, RequestHistoryResult::Success(now()));
    }

    fn log_request_error(&self, request_id: RequestId, error: &ExecutionError) {
        self.data()
            .set_request_result(request_id, RequestHistoryResult::Error(now(), error.clone()));
    }

    fn log_new_speculative_fiber(&self, request_id: RequestId) -> SpeculativeId {
        let mut data = self.data();
        let speculative_id = SpeculativeId(data.fibers.len());
        let position = match data.history.requests.get_mut(request_id.0) {
            Some(request) => {
                request.speculative_fibers.push(FiberHistory {
                    start_time: now(),
                    attempts: Vec::new(),
                });
                request.speculative_fibers.len() - 1
            }
            None => {
                warn!("HistoryCollector - fiber started for unknown request {:?}", request_id);
                usize::MAX
            }
        };
        data.fibers.push((request_id, position));
        speculative_id
    }

    fn log_attempt_start(
        &self,
        request_id: RequestId,
        speculative_id: Option<SpeculativeId>,
        node_addr: SocketAddr,
    ) -> AttemptId {
        let mut data = self.data();
        let attempt_id = AttemptId(data.attempts.len());

        let fiber = match speculative_id {
            None => Some(None),
            Some(spec) => match data.fibers.get(spec.0) {
                Some((owner, position)) if *owner == request_id => Some(Some(*position)),
                _ => None,
            },
        };

        let location = fiber.and_then(|fiber| {
            let mut location = AttemptLocation {
                request: request_id,
                fiber,
                index: 0,
            };
            let fiber_history = data.fiber_mut(location)?;
            fiber_history.attempts.push(AttemptHistory {
                attempt_id,
                send_time: now(),
                node_addr,
                result: None,
            });
            location.index = fiber_history.attempts.len() - 1;
            Some(location)
        });

        if location.is_none() {
            warn!(
                "HistoryCollector - attempt for unknown request {:?} / fiber {:?}",
                request_id, speculative_id
            );
        }
        data.attempts.push(location);
        attempt_id
    }

    fn log_attempt_success(&self, attempt_id: AttemptId) {
        if let Some(attempt) = self.data().attempt_mut(attempt_id) {
            attempt.result = Some(AttemptResult::Success(now()));
        }
    }

    fn log_attempt_error(
        &self,
        attempt_id: AttemptId,
        error: &RequestAttemptError,
        retry_decision: &RetryDecision,
    ) {
        let mut data = self.data();
        match data.attempt_mut(attempt_id) {
            Some(attempt) => {
                if attempt.result.is_some() {
                    warn!("HistoryCollector - attempt {:?} has multiple results", attempt_id);
                }
                attempt.result = Some(AttemptResult::Error(
                    now(),
                    error.clone(),
                    retry_decision.clone(),
                ));
            }
            None => warn!(
                "HistoryCollector - attempt {:?} finished with an error but was never started",
                attempt_id
            ),
        }
    }
}

/// Structured history of all requests seen by a [`HistoryCollector`].
///
/// Its `Display` impl prints a readable report.
#[derive(Debug, Clone, Default)]
pub struct StructuredHistory {
    pub requests: Vec<RequestHistory>,
}

#[derive(Debug, Clone)]
pub struct RequestHistory {
    pub start_time: TimePoint,
    pub non_speculative_fiber: FiberHistory,
    pub speculative_fibers: Vec<FiberHistory>,
    pub result: Option<RequestHistoryResult>,
}

#[derive(Debug, Clone)]
pub enum RequestHistoryResult {
    Success(TimePoint),
    Error(TimePoint, ExecutionError),
}

#[derive(Debug, Clone)]
pub struct FiberHistory {
    pub start_time: TimePoint,
    pub attempts: Vec<AttemptHistory>,
}

#[derive(Debug, Clone)]
pub struct AttemptHistory {
    pub attempt_id: AttemptId,
    pub send_time: TimePoint,
    pub node_addr: SocketAddr,
    pub result: Option<AttemptResult>,
}

#[derive(Debug, Clone)]
pub enum AttemptResult {
    Success(TimePoint),
    Error(TimePoint, RequestAttemptError, RetryDecision),
}

impl RequestHistory {
    /// All attempts of the request, across fibers, in the order they were started.
    pub fn attempts(&self) -> Vec<&AttemptHistory> {
        let mut attempts: Vec<&AttemptHistory> = std::iter::once(&self.non_speculative_fiber)
            .chain(self.speculative_fibers.iter())
            .flat_map(|fiber| fiber.attempts.iter())
            .collect();
        attempts.sort_by_key(|attempt| attempt.attempt_id);
        attempts
    }

    /// Addresses of the nodes the request was sent to, in the order of sending.
    pub fn attempted_hosts(&self) -> Vec<SocketAddr> {
        self.attempts()
            .into_iter()
            .map(|attempt| attempt.node_addr)
            .collect()
    }
}

impl Display for StructuredHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Requests History:")?;
        for (i, request) in self.requests.iter().enumerate() {
            writeln!(f, "=== Request #{i} ===")?;
            write!(f, "{request}")?;
            writeln!(f, "=================")?;
        }
        Ok(())
    }
}

impl Display for RequestHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "| start_time: {}", self.start_time)?;
        writeln!(f, "| Non-speculative attempts:")?;
        write_fiber_attempts(&self.non_speculative_fiber, f)?;
        for (spec_i, fiber) in self.speculative_fibers.iter().enumerate() {
            writeln!(f, "|")?;
            writeln!(f, "| > Speculative fiber #{spec_i}")?;
            writeln!(f, "| fiber start time: {}", fiber.start_time)?;
            write_fiber_attempts(fiber, f)?;
        }
        writeln!(f, "|")?;
        match &self.result {
            Some(RequestHistoryResult::Success(time)) => {
                writeln!(f, "| Request successful at {time}")
            }
            Some(RequestHistoryResult::Error(time, error)) => {
                writeln!(f, "| Request failed at {time}")?;
                writeln!(f, "| Error: {error}")
            }
            None => writeln!(f, "| Request still running - no final result yet"),
        }
    }
}

fn write_fiber_attempts(fiber: &FiberHistory, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    for (i, attempt) in fiber.attempts.iter().enumerate() {
        if i != 0 {
            writeln!(f, "|")?;
        }
        writeln!(f, "| - Attempt #{} sent to {}", i, attempt.node_addr)?;
        writeln!(f, "|   request send time: {}", attempt.send_time)?;
        match &attempt.result {
            Some(AttemptResult::Success(time)) => writeln!(f, "|   Success at {time}")?,
            Some(AttemptResult::Error(time, err, retry_decision)) => {
                writeln!(f, "|   Error at {time}")?;
                writeln!(f, "|   Error: {err}")?;
                writeln!(f, "|   Retry decision: {retry_decision:?}")?;
            }
            None => writeln!(f, "|   No result yet")?,
        };
    }

    Ok(())
}
