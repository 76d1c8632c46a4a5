//! Running one request to completion: walking the query plan, retrying and
//! speculating as the profile's policies decide, and recording the history.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use kestrel_cql::frame::request::query::{Query, QueryParameters};
use kestrel_cql::{Consistency, SerialConsistency};
use futures::future::join_all;
use smallvec::SmallVec;
use tracing::field::Empty;
use tracing::{debug, debug_span, trace, trace_span, Instrument};

use super::execution_profile::ResolvedProfile;
use crate::cluster::{ClusterState, NodeRef};
use crate::errors::{ExecutionError, RequestAttemptError};
use crate::network::Connection;
use crate::observability::history::{
    AttemptId, HistoryCollector, HistoryListener, RequestHistory, RequestId, SpeculativeId,
};
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::retry::{RequestInfo, RetryDecision, RetryPolicy};
use crate::policies::speculative_execution;
use crate::response::{Coordinator, QueryResponse, QueryResult};
use crate::statement::Statement;
use crate::utils::SpanExt;

/// A request with everything needed to run it on its own, away from the session.
pub(crate) struct RequestExecution {
    pub(crate) cluster_state: Arc<ClusterState>,
    pub(crate) profile: Arc<ResolvedProfile>,
    pub(crate) statement: Statement,
}

/// Preparing a statement: PREPARE goes to every node of the statement's plan,
/// and the first node in plan order that accepts it decides the outcome.
pub(crate) struct PrepareExecution {
    pub(crate) cluster_state: Arc<ClusterState>,
    pub(crate) profile: Arc<ResolvedProfile>,
    pub(crate) statement: Statement,
}

fn routing_info<'a>(
    statement: &'a Statement,
    profile: &ResolvedProfile,
    cluster_state: &ClusterState,
) -> RoutingInfo<'a> {
    let config = &statement.config;
    RoutingInfo {
        consistency: config.determine_consistency(profile.consistency),
        serial_consistency: config
            .serial_consistency
            .unwrap_or(profile.serial_consistency),
        token: statement
            .effective_routing_key()
            .map(|key| cluster_state.compute_token(&key)),
        keyspace: statement.get_keyspace(),
    }
}

// The plan is shared by the fibers of a request; each node is handed out once.
struct SharedPlan<'a> {
    iter: Mutex<Plan<'a>>,
}

impl<'a> Iterator for &SharedPlan<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next()
    }
}

struct RequestContext<'a> {
    routing_info: &'a RoutingInfo<'a>,
    load_balancer: &'a dyn LoadBalancingPolicy,
    retry_policy: &'a dyn RetryPolicy,
    serial_consistency: Option<SerialConsistency>,
}

impl RequestExecution {
    /// Runs the request and returns its outcome together with its history.
    pub(crate) async fn run(self) -> (Result<QueryResult, ExecutionError>, Option<RequestHistory>) {
        let config = &self.statement.config;
        let routing_info = routing_info(&self.statement, &self.profile, &self.cluster_state);
        let consistency = routing_info.consistency;
        let serial_consistency = routing_info.serial_consistency;
        let load_balancer = self.profile.load_balancer(&self.cluster_state);

        // Declared after everything the fibers borrow, so it is dropped first.
        let collector = HistoryCollector::new();
        let histories =
            RequestHistories::start(&collector, self.statement.config.history_listener.as_deref());

        let request_span = debug_span!(
            "Request",
            statement = %self.statement.contents,
            prepared = self.statement.get_prepared().is_some(),
            consistency = %consistency,
            otel.status_code = Empty,
            otel.status_message = Empty,
        );

        let context = RequestContext {
            routing_info: &routing_info,
            load_balancer: load_balancer.as_ref(),
            retry_policy: self.profile.retry_policy.as_ref(),
            serial_consistency,
        };
        let plan = Plan::new(load_balancer.as_ref(), &routing_info, &self.cluster_state);

        let speculative_policy = self.profile.speculative_execution_policy.as_ref();
        let runner = async {
            if config.is_idempotent && speculative_policy.max_speculative_executions() > 0 {
                let shared_plan = SharedPlan {
                    iter: Mutex::new(plan),
                };
                let fiber_generator = |fiber_id: usize| {
                    let fiber = histories.start_fiber(fiber_id);
                    self.run_fiber(&shared_plan, &context, fiber, fiber_id)
                };
                speculative_execution::execute(speculative_policy, fiber_generator).await
            } else {
                let fiber = histories.start_fiber(0);
                self.run_fiber(plan, &context, fiber, 0)
                    .await
                    .unwrap_or(Err(ExecutionError::NoHostsAvailable))
            }
        }
        .instrument(request_span.clone());

        let timeout = config
            .request_timeout
            .unwrap_or(self.profile.request_timeout);
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, runner)
                .await
                .unwrap_or(Err(ExecutionError::RequestTimeout(timeout))),
            None => runner.await,
        };

        match &result {
            Ok(_) => histories.log_request_success(),
            Err(e) => {
                histories.log_request_error(e);
                request_span.record_error(e);
            }
        }

        let history = collector.request_history(histories.collector_request_id());
        let result = result.map(|result| result.with_history(history.clone()));
        (result, history)
    }

    // Sends the statement as EXECUTE if it was prepared, as QUERY otherwise.
    async fn send(
        &self,
        connection: &Connection,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let tracing = self.statement.get_tracing();
        let mut parameters = QueryParameters {
            consistency,
            serial_consistency,
            timestamp: self.statement.get_timestamp(),
            page_size: self.statement.get_page_size(),
            paging_state: None,
            keyspace: None,
            values: self.statement.get_values().clone(),
        };

        match self.statement.get_prepared() {
            // The keyspace of a prepared statement was bound by PREPARE.
            Some(prepared) => connection.execute(prepared, parameters, tracing).await,
            None => {
                parameters.keyspace = self
                    .statement
                    .get_keyspace()
                    .filter(|_| connection.features().set_keyspace)
                    .map(str::to_owned);
                let query = Query {
                    contents: self.statement.contents.clone(),
                    parameters,
                };
                connection.query(&query, tracing).await
            }
        }
    }

    /// Walks `plan`, retrying as the retry policy decides.
    ///
    /// Returns None if the plan had no node to offer.
    async fn run_fiber<'a>(
        &'a self,
        plan: impl Iterator<Item = NodeRef<'a>>,
        context: &RequestContext<'a>,
        fiber: FiberHistory<'_>,
        fiber_id: usize,
    ) -> Option<Result<QueryResult, ExecutionError>> {
        let mut last_error: Option<ExecutionError> = None;
        let mut current_consistency = context.routing_info.consistency;
        let mut retry_count: u32 = 0;

        'nodes_in_plan: for node in plan {
            let span = trace_span!("Executing request", node = %node.address, fiber_id);
            'same_node_retries: loop {
                trace!(parent: &span, "Execution started");
                let connection = match node.connection().await {
                    Ok(connection) => connection,
                    Err(e) => {
                        trace!(
                            parent: &span,
                            error = %e,
                            "Choosing connection failed"
                        );
                        last_error = Some(ExecutionError::ConnectionPoolError {
                            node: node.address,
                            error: e,
                        });
                        continue 'nodes_in_plan;
                    }
                };

                let connect_address = connection.connect_address();
                trace!(parent: &span, connection = %connect_address, "Sending");
                let attempt_ids = fiber.log_attempt_start(connect_address);
                let request_start = Instant::now();
                let request_result: Result<QueryResult, RequestAttemptError> = async {
                    self.send(&connection, current_consistency, context.serial_consistency)
                        .await?
                        .into_non_error_query_response()?
                        .into_query_result(Coordinator::new(node, &connection))
                }
                .instrument(span.clone())
                .await;
                let elapsed = request_start.elapsed();

                let request_error = match request_result {
                    Ok(result) => {
                        trace!(parent: &span, "Request succeeded");
                        fiber.log_attempt_success(&attempt_ids);
                        context
                            .load_balancer
                            .on_request_success(context.routing_info, elapsed, node);
                        return Some(Ok(result));
                    }
                    Err(e) => {
                        trace!(parent: &span, last_error = %e, "Request failed");
                        context
                            .load_balancer
                            .on_request_failure(context.routing_info, elapsed, node, &e);
                        e
                    }
                };

                let retry_decision = context.retry_policy.decide_should_retry(RequestInfo {
                    error: &request_error,
                    is_idempotent: self.statement.get_is_idempotent(),
                    consistency: current_consistency,
                    retry_count,
                });
                trace!(parent: &span, retry_decision = ?retry_decision);
                fiber.log_attempt_error(&attempt_ids, &request_error, &retry_decision);
                last_error = Some(request_error.into());

                match retry_decision {
                    RetryDecision::RetrySameNode(new_cl) => {
                        retry_count += 1;
                        current_consistency = new_cl.unwrap_or(current_consistency);
                        continue 'same_node_retries;
                    }
                    RetryDecision::RetryNextNode(new_cl) => {
                        retry_count += 1;
                        current_consistency = new_cl.unwrap_or(current_consistency);
                        continue 'nodes_in_plan;
                    }
                    RetryDecision::DontRetry => break 'nodes_in_plan,
                    RetryDecision::IgnoreWriteError => {
                        return Some(Ok(QueryResult::new(
                            Coordinator::new(node, &connection),
                            None,
                            None,
                            Vec::new(),
                        )));
                    }
                }
            }
        }

        last_error.map(Err)
    }
}

impl PrepareExecution {
    pub(crate) async fn run(self) -> Result<Statement, ExecutionError> {
        let routing_info = routing_info(&self.statement, &self.profile, &self.cluster_state);
        let load_balancer = self.profile.load_balancer(&self.cluster_state);
        let plan = Plan::new(load_balancer.as_ref(), &routing_info, &self.cluster_state);

        let contents = self.statement.contents.as_str();
        let keyspace = self.statement.get_keyspace();
        let attempts = plan.map(|node| async move {
            let connection =
                node.connection()
                    .await
                    .map_err(|error| ExecutionError::ConnectionPoolError {
                        node: node.address,
                        error,
                    })?;
            connection
                .prepare(contents, keyspace)
                .await
                .map_err(ExecutionError::from)
        });
        let results = join_all(attempts).await;

        let mut prepared = None;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(statement) => {
                    prepared.get_or_insert(statement);
                }
                Err(e) => {
                    debug!("Preparing \"{}\" failed: {}", contents, e);
                    last_error = Some(e);
                }
            }
        }

        match prepared {
            Some(prepared) => {
                trace!(id = ?prepared.get_id(), "Statement prepared");
                let mut statement = self.statement;
                statement.set_prepared(prepared);
                Ok(statement)
            }
            None => Err(last_error.unwrap_or(ExecutionError::NoHostsAvailable)),
        }
    }
}

// Each request reports to its own collector, and to the statement's listener if it has one.
// Listeners hand out their own ids, so every id is kept per listener.
struct RequestHistories<'a> {
    listeners: SmallVec<[(&'a dyn HistoryListener, RequestId); 2]>,
}

struct FiberHistory<'a> {
    listeners: SmallVec<[(&'a dyn HistoryListener, RequestId, Option<SpeculativeId>); 2]>,
}

type AttemptIds = SmallVec<[AttemptId; 2]>;

impl<'a> RequestHistories<'a> {
    fn start(
        collector: &'a HistoryCollector,
        statement_listener: Option<&'a dyn HistoryListener>,
    ) -> Self {
        let listeners = std::iter::once(collector as &dyn HistoryListener)
            .chain(statement_listener)
            .map(|listener| (listener, listener.log_request_start()))
            .collect();
        RequestHistories { listeners }
    }

    fn collector_request_id(&self) -> RequestId {
        // The collector is always registered first.
        self.listeners[0].1
    }

    fn start_fiber(&self, fiber_id: usize) -> FiberHistory<'a> {
        let listeners = self
            .listeners
            .iter()
            .map(|&(listener, request_id)| {
                let speculative_id =
                    (fiber_id > 0).then(|| listener.log_new_speculative_fiber(request_id));
                (listener, request_id, speculative_id)
            })
            .collect();
        FiberHistory { listeners }
    }

    fn log_request_success(&self) {
        for (listener, request_id) in &self.listeners {
            listener.log_request_success(*request_id);
        }
    }

    fn log_request_error(&self, error: &ExecutionError) {
        for (listener, request_id) in &self.listeners {
            listener.log_request_error(*request_id, error);
        }
    }
}

impl FiberHistory<'_> {
    fn log_attempt_start(&self, node_addr: SocketAddr) -> AttemptIds {
        self.listeners
            .iter()
            .map(|(listener, request_id, speculative_id)| {
                listener.log_attempt_start(*request_id, *speculative_id, node_addr)
            })
            .collect()
    }

    fn log_attempt_success(&self, attempt_ids: &AttemptIds) {
        for ((listener, _, _), attempt_id) in self.listeners.iter().zip(attempt_ids) {
            listener.log_attempt_success(*attempt_id);
        }
    }

    fn log_attempt_error(
        &self,
        attempt_ids: &AttemptIds,
        error: &RequestAttemptError,
        retry_decision: &RetryDecision,
    ) {
        for ((listener, _, _), attempt_id) in self.listeners.iter().zip(attempt_ids) {
            listener.log_attempt_error(*attempt_id, error, retry_decision);
        }
    }
}
