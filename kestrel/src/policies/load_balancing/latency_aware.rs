//! Penalising nodes that are much slower than the fastest one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{trace, warn};
use uuid::Uuid;

use super::{FallbackPlan, LoadBalancingPolicy, NodeDistance, RoutingInfo};
use crate::cluster::{ClusterState, Node, NodeRef};
use crate::errors::{DbError, RequestAttemptError};

type NodeAverages = HashMap<Uuid, RwLock<Option<TimestampedAverage>>>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    fn new() -> Self {
        Self(AtomicU64::new(u64::MAX))
    }

    fn store(&self, duration: Duration) {
        self.0.store(duration.as_micros() as u64, Ordering::Relaxed)
    }

    fn load(&self) -> Option<Duration> {
        let micros = self.0.load(Ordering::Relaxed);
        if micros == u64::MAX {
            None
        } else {
            Some(Duration::from_micros(micros))
        }
    }
}

impl std::fmt::Debug for AtomicDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load().fmt(f)
    }
}

/// A decaying average of the latencies of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimestampedAverage {
    timestamp: Instant,
    average: Duration,
    num_measures: usize,
}

impl TimestampedAverage {
    // The weight of the previous average decays logarithmically with the time since it was computed.
    fn compute_next(previous: Option<Self>, last_latency: Duration, scale_secs: f64) -> Option<Self> {
        let now = Instant::now();
        match previous {
            prev if last_latency.is_zero() => prev,
            None => Some(Self {
                num_measures: 1,
                average: last_latency,
                timestamp: now,
            }),
            Some(prev_avg) => Some({
                let delay = now
                    .saturating_duration_since(prev_avg.timestamp)
                    .as_secs_f64();
                let scaled_delay = delay / scale_secs;
                let prev_weight = if scaled_delay <= 0. {
                    1.
                } else {
                    (scaled_delay + 1.).ln() / scaled_delay
                };

                let last_latency_secs = last_latency.as_secs_f64();
                let prev_avg_secs = prev_avg.average.as_secs_f64();
                let average = match Duration::try_from_secs_f64(
                    (1. - prev_weight) * last_latency_secs + prev_weight * prev_avg_secs,
                ) {
                    Ok(ts) => ts,
                    Err(e) => {
                        warn!(
                            "Error while calculating average: {e}. \
                            prev_avg_secs: {prev_avg_secs}, \
                            last_latency_secs: {last_latency_secs}, \
                            prev_weight: {prev_weight}"
                        );
                        prev_avg.average
                    }
                };
                Self {
                    num_measures: prev_avg.num_measures + 1,
                    timestamp: now,
                    average,
                }
            }),
        }
    }
}

enum FastEnough {
    Yes,
    No { average: Duration },
}

fn fast_enough(
    average_latencies: &NodeAverages,
    node: Uuid,
    settings: &LatencyAwarenessBuilder,
    min_avg: Duration,
) -> FastEnough {
    let avg = match average_latencies.get(&node).and_then(|avg| *read(avg)) {
        Some(avg) => avg,
        None => return FastEnough::Yes,
    };
    if avg.num_measures >= settings.minimum_measurements
        && avg.timestamp.elapsed() < settings.retry_period
        && avg.average.as_micros() as f64
            > settings.exclusion_threshold * min_avg.as_micros() as f64
    {
        FastEnough::No {
            average: avg.average,
        }
    } else {
        FastEnough::Yes
    }
}

/// Updates minimum average latency upon each call to `tick()`.
/// The said average is a crucial criterium for penalising "too slow" nodes.
struct MinAvgUpdater {
    node_avgs: Arc<RwLock<NodeAverages>>,
    min_latency: Arc<AtomicDuration>,
    minimum_measurements: usize,
}

impl MinAvgUpdater {
    fn tick(&self) {
        let averages = read(&self.node_avgs);
        if averages.is_empty() {
            return; // No requests were measured yet.
        }

        let min_avg = averages
            .values()
            .filter_map(|avg| {
                read(avg).and_then(|timestamped_average| {
                    (timestamped_average.num_measures >= self.minimum_measurements)
                        .then_some(timestamped_average.average)
                })
            })
            .min();
        if let Some(min_avg) = min_avg {
            self.min_latency.store(min_avg);
            trace!(
                "Latency awareness: updated min average latency to {} ms",
                min_avg.as_secs_f64() * 1000.
            );
        }
    }
}

/// Wraps a child policy and moves the nodes that are much slower than the fastest one
/// to the end of its plans.
///
/// Every request's latency feeds a per-node decaying average. Periodically the minimum of
/// the averages is recomputed; a node whose average exceeds `exclusion_threshold` times
/// that minimum is penalised until its average has not been updated for `retry_period`.
/// Nodes with fewer than `minimum_measurements` measurements are never penalised.
#[derive(Debug)]
pub struct LatencyAwarePolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    settings: LatencyAwarenessBuilder,

    /// Last minimum average latency that was noted among the nodes. It is updated every
    /// `update_rate`.
    last_min_latency: Arc<AtomicDuration>,
    node_avgs: Arc<RwLock<NodeAverages>>,

    // Started by `init`, which runs inside the runtime.
    updater_handle: Mutex<Option<RemoteHandle<()>>>,
}

impl LatencyAwarePolicy {
    /// Wraps `child` with the default latency awareness settings.
    pub fn new(child: Arc<dyn LoadBalancingPolicy>) -> Self {
        LatencyAwarenessBuilder::new().build(child)
    }

    fn updater(&self) -> MinAvgUpdater {
        MinAvgUpdater {
            node_avgs: self.node_avgs.clone(),
            min_latency: self.last_min_latency.clone(),
            minimum_measurements: self.settings.minimum_measurements,
        }
    }

    fn start_updater(&self) {
        let mut handle = self
            .updater_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handle.is_some() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("Latency awareness: no runtime to run the minimum latency updater on");
            return;
        }

        let updater = self.updater();
        let update_rate = self.settings.update_rate;
        let (updater_fut, updater_handle) = async move {
            let mut update_scheduler = tokio::time::interval(update_rate);
            loop {
                update_scheduler.tick().await;
                updater.tick();
            }
        }
        .remote_handle();
        tokio::task::spawn(updater_fut);
        *handle = Some(updater_handle);
    }

    fn report_request(&self, node: &Node, latency: Duration) {
        let scale_secs = self.settings.scale.as_secs_f64();
        let node_avgs_guard = read(&self.node_avgs);
        if let Some(previous_node_avg) = node_avgs_guard.get(&node.host_id) {
            // The usual path, the node has been already noticed.
            let mut node_avg_guard = write(previous_node_avg);
            *node_avg_guard = TimestampedAverage::compute_next(*node_avg_guard, latency, scale_secs);
        } else {
            // We drop the read lock not to deadlock while taking write lock.
            drop(node_avgs_guard);
            let mut node_avgs_guard = write(&self.node_avgs);

            // Other threads may have raced with us.
            let previous_node_avg = node_avgs_guard
                .get(&node.host_id)
                .and_then(|rwlock| *read(rwlock));
            node_avgs_guard.insert(
                node.host_id,
                RwLock::new(TimestampedAverage::compute_next(
                    previous_node_avg,
                    latency,
                    scale_secs,
                )),
            );
        }
    }

    // Errors returned quickly after the request begins say nothing about the node's latency.
    fn reliable_latency_measure(error: &RequestAttemptError) -> bool {
        match error {
            RequestAttemptError::CqlRequestSerialization(_)
            | RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::NoStreamsAvailable
            | RequestAttemptError::DbError(DbError::IsBootstrapping, _)
            | RequestAttemptError::DbError(DbError::Unavailable { .. }, _)
            | RequestAttemptError::DbError(DbError::Unprepared { .. }, _)
            | RequestAttemptError::DbError(DbError::Overloaded, _) => false,

            RequestAttemptError::DbError(_, _)
            | RequestAttemptError::CqlResponseParseError(_)
            | RequestAttemptError::BodyExtensionsParseError(_)
            | RequestAttemptError::RepreparedIdChanged { .. }
            | RequestAttemptError::UnexpectedResponse(_) => true,
        }
    }
}

impl LoadBalancingPolicy for LatencyAwarePolicy {
    fn init(&self, cluster: &ClusterState) {
        self.start_updater();
        self.child.init(cluster)
    }

    fn new_instance(&self) -> Option<Arc<dyn LoadBalancingPolicy>> {
        let child = self.child.new_instance()?;
        Some(Arc::new(self.settings.clone().build(child)))
    }

    fn distance(&self, node: NodeRef<'_>, cluster: &ClusterState) -> NodeDistance {
        self.child.distance(node, cluster)
    }

    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        let picked = self.child.pick(request, cluster);
        let (Some(node), Some(min_avg_latency)) = (picked, self.last_min_latency.load()) else {
            return picked;
        };
        let fast = matches!(
            fast_enough(
                &read(&self.node_avgs),
                node.host_id,
                &self.settings,
                min_avg_latency
            ),
            FastEnough::Yes
        );
        if fast {
            Some(node)
        } else {
            self.fallback(request, cluster).next()
        }
    }

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        let fallback = self.child.fallback(request, cluster);
        let min_avg_latency = match self.last_min_latency.load() {
            Some(min_avg) => min_avg,
            None => return fallback, // noop, as no latency data has been collected yet
        };

        let average_latencies = read(&self.node_avgs);
        let (fast_nodes, penalised_nodes): (Vec<_>, Vec<_>) = fallback.partition(|node| {
            match fast_enough(
                &average_latencies,
                node.host_id,
                &self.settings,
                min_avg_latency,
            ) {
                FastEnough::Yes => true,
                FastEnough::No { average } => {
                    trace!(
                        "Latency awareness: Penalising node {{address={}, datacenter={:?}}} for being on average at least {} times slower (latency: {}ms) than the fastest ({}ms).",
                        node.address,
                        node.datacenter,
                        self.settings.exclusion_threshold,
                        average.as_millis(),
                        min_avg_latency.as_millis()
                    );
                    false
                }
            }
        });

        Box::new(fast_nodes.into_iter().chain(penalised_nodes))
    }

    fn on_request_success(&self, request: &RoutingInfo, latency: Duration, node: NodeRef<'_>) {
        self.report_request(node, latency);
        self.child.on_request_success(request, latency, node)
    }

    fn on_request_failure(
        &self,
        request: &RoutingInfo,
        latency: Duration,
        node: NodeRef<'_>,
        error: &RequestAttemptError,
    ) {
        if Self::reliable_latency_measure(error) {
            self.report_request(node, latency);
        }
        self.child.on_request_failure(request, latency, node, error)
    }

    fn name(&self) -> String {
        format!("LatencyAwarePolicy({})", self.child.name())
    }
}

/// The settings of [LatencyAwarePolicy].
///
/// # Example
/// ```
/// # use std::sync::Arc;
/// use kestrel::policies::load_balancing::{LatencyAwarenessBuilder, RoundRobinPolicy};
///
/// let policy = LatencyAwarenessBuilder::new()
///     .exclusion_threshold(3.)
///     .minimum_measurements(200)
///     .build(Arc::new(RoundRobinPolicy::new()));
/// ```
#[derive(Debug, Clone)]
pub struct LatencyAwarenessBuilder {
    exclusion_threshold: f64,
    retry_period: Duration,
    update_rate: Duration,
    minimum_measurements: usize,
    scale: Duration,
}

impl LatencyAwarenessBuilder {
    /// Creates a builder with the default settings.
    pub fn new() -> Self {
        Self {
            exclusion_threshold: 2_f64,
            retry_period: Duration::from_secs(10),
            update_rate: Duration::from_millis(100),
            minimum_measurements: 50,
            scale: Duration::from_millis(100),
        }
    }

    /// Sets minimum measurements for latency awareness (if there have been fewer measurements taken for a node,
    /// the node will not be penalised).
    ///
    /// The default for this option is **50**.
    pub fn minimum_measurements(self, minimum_measurements: usize) -> Self {
        Self {
            minimum_measurements,
            ..self
        }
    }

    /// Sets retry period for latency awareness (max time that a node is being penalised).
    ///
    /// A node is penalised only while its average was updated less than `retry_period` ago.
    /// Since penalised nodes will likely not see their latency updated, this is basically how long
    /// the policy will penalise a node. The default is **10 seconds**.
    pub fn retry_period(self, retry_period: Duration) -> Self {
        Self {
            retry_period,
            ..self
        }
    }

    /// Sets exclusion threshold for latency awareness (a threshold for a node to be penalised).
    ///
    /// For example, if set to 2, the resulting policy penalises nodes that are more than twice
    /// slower than the fastest node. The default is **2**.
    pub fn exclusion_threshold(self, exclusion_threshold: f64) -> Self {
        Self {
            exclusion_threshold,
            ..self
        }
    }

    /// Sets update rate for latency awareness (how often is the global minimal average latency updated).
    ///
    /// The default update rate is **100 milliseconds**.
    pub fn update_rate(self, update_rate: Duration) -> Self {
        Self {
            update_rate,
            ..self
        }
    }

    /// Sets the scale to use for the resulting latency aware policy.
    ///
    /// For a given host, if a new latency `l` is received at time `t`, and
    /// the previously calculated average is `prev` calculated at time `t'`, then the
    /// newly calculated average `avg` for that host is calculated thusly:
    ///
    /// ```text
    /// d = (t - t') / scale
    /// alpha = 1 - (ln(d+1) / d)
    /// avg = alpha * l + (1 - alpha) * prev
    /// ```
    ///
    /// The default scale is **100 milliseconds**.
    pub fn scale(self, scale: Duration) -> Self {
        Self { scale, ..self }
    }

    /// Builds a [LatencyAwarePolicy] wrapping `child`.
    pub fn build(self, child: Arc<dyn LoadBalancingPolicy>) -> LatencyAwarePolicy {
        LatencyAwarePolicy {
            child,
            settings: self,
            last_min_latency: Arc::new(AtomicDuration::new()),
            node_avgs: Arc::new(RwLock::new(HashMap::new())),
            updater_handle: Mutex::new(None),
        }
    }
}

impl Default for LatencyAwarenessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // Tests start with a paused clock, so that averages and retry periods do not depend on timing.

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{LatencyAwarePolicy, LatencyAwarenessBuilder};
    use crate::cluster::ClusterState;
    use crate::errors::RequestAttemptError;
    use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoundRobinPolicy, RoutingInfo};
    use crate::utils::test_utils::{mock_cluster_state, setup_tracing};

    fn policy() -> LatencyAwarePolicy {
        LatencyAwarenessBuilder::new()
            .minimum_measurements(3)
            .retry_period(Duration::from_secs(1))
            .build(Arc::new(RoundRobinPolicy::new()))
    }

    fn state() -> ClusterState {
        mock_cluster_state(&[(1, "dc1", &[]), (2, "dc1", &[]), (3, "dc1", &[])])
    }

    fn feed(policy: &LatencyAwarePolicy, state: &ClusterState, latencies_ms: [u64; 3]) {
        let info = RoutingInfo::default();
        for (node, latency) in state.get_nodes_info().iter().zip(latencies_ms) {
            for _ in 0..3 {
                policy.on_request_success(&info, Duration::from_millis(latency), node);
            }
        }
        policy.updater().tick();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn no_measurements_keep_child_order() {
        setup_tracing();
        let state = state();
        let policy = policy();
        let info = RoutingInfo::default();
        assert_eq!(Plan::new(&policy, &info, &state).count(), 3);
        assert!(policy.last_min_latency.load().is_none());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn slow_node_goes_to_the_end() {
        setup_tracing();
        let state = state();
        let policy = policy();
        feed(&policy, &state, [10, 100, 12]);
        assert_eq!(policy.last_min_latency.load(), Some(Duration::from_millis(10)));

        let slow = &state.get_nodes_info()[1];
        let info = RoutingInfo::default();
        for _ in 0..6 {
            let plan: Vec<_> = Plan::new(&policy, &info, &state).collect();
            assert_eq!(plan.len(), 3);
            assert!(Arc::ptr_eq(plan[2], slow));
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn child_rotation_advances_once_per_plan() {
        setup_tracing();
        let state = state();
        let policy = policy();
        feed(&policy, &state, [10, 11, 12]);
        let info = RoutingInfo::default();

        let mut first_places: HashMap<_, usize> = HashMap::new();
        for _ in 0..300 {
            let mut plan = Plan::new(&policy, &info, &state);
            let first = plan.next().unwrap();
            assert!(plan.next().is_some());
            *first_places.entry(first.host_id).or_default() += 1;
        }
        assert_eq!(first_places.len(), 3, "{first_places:?}");
        assert!(first_places.values().all(|count| *count == 100));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn penalty_expires_after_retry_period() {
        setup_tracing();
        let state = state();
        let policy = policy();
        feed(&policy, &state, [10, 100, 12]);
        tokio::time::advance(Duration::from_secs(2)).await;

        let slow = &state.get_nodes_info()[1];
        let info = RoutingInfo::default();
        let first_places = (0..3)
            .filter(|_| Arc::ptr_eq(Plan::new(&policy, &info, &state).next().unwrap(), slow))
            .count();
        assert_eq!(first_places, 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn fast_failures_are_not_measured() {
        setup_tracing();
        let state = state();
        let policy = policy();
        let info = RoutingInfo::default();
        let node = &state.get_nodes_info()[0];
        for _ in 0..5 {
            policy.on_request_failure(
                &info,
                Duration::from_secs(1),
                node,
                &RequestAttemptError::NoStreamsAvailable,
            );
        }
        assert!(super::read(&policy.node_avgs).is_empty());
    }
}
