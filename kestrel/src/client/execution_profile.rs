//! `ExecutionProfile` is a grouping of configurable options regarding request execution.
//!
//! Profiles can be created to represent different workloads, which thanks to them
//! can be run conveniently on a single session.
//!
//! A session configuration holds one default profile and any number of named ones.
//! Every field of a profile is optional: a field left unset on a named profile
//! takes the value of the default profile, and a field left unset on the default
//! profile takes the library default (see [`defaults`]).
//!
//! Once the session is connected, each profile is resolved into a complete set of
//! options and pointed at by an [`ExecutionProfileHandle`]. Handles can be attached
//! to statements, and remapped to another profile at runtime.
//!
//! ### Example
//! To register a named profile and use it for a statement:
//! ```
//! # use std::error::Error;
//! # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
//! use std::time::Duration;
//! use kestrel::client::{ExecutionProfile, Session, SessionBuilder};
//! use kestrel::statement::{Consistency, Statement};
//!
//! let analytics = ExecutionProfile::builder()
//!     .consistency(Consistency::All)
//!     .request_timeout(Some(Duration::from_secs(30)))
//!     .build();
//!
//! let session: Session = SessionBuilder::new()
//!     .known_node("127.0.0.1:9042".parse()?)
//!     .execution_profile("analytics", analytics)
//!     .build()
//!     .await?;
//!
//! let statement = Statement::new("SELECT * FROM ks.tab").with_execution_profile("analytics");
//! let result = session.execute(statement).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Example
//! To create an `ExecutionProfile` with options defaulting to those set on another profile:
//! ```
//! use std::time::Duration;
//! use kestrel::client::ExecutionProfile;
//! use kestrel::statement::Consistency;
//!
//! let base_profile = ExecutionProfile::builder()
//!     .request_timeout(Some(Duration::from_secs(30)))
//!     .build();
//!
//! let profile = base_profile.to_builder()
//!     .consistency(Consistency::All)
//!     .build();
//! ```

use std::sync::{Arc, Once};
use std::time::Duration;

use arc_swap::ArcSwap;
use kestrel_cql::{Consistency, SerialConsistency};
use tracing::debug;

use crate::cluster::ClusterState;
use crate::policies::load_balancing::{
    HostFilter, HostFilterPolicy, LatencyAwarenessBuilder, LoadBalancingPolicy, TokenAwarePolicy,
};
use crate::policies::retry::RetryPolicy;
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;

/// Values used for the options that neither a profile nor the default profile set.
pub mod defaults {
    use std::sync::Arc;
    use std::time::Duration;

    use kestrel_cql::{Consistency, SerialConsistency};

    use crate::policies::load_balancing::{
        DcAwareRoundRobinPolicy, LatencyAwarenessBuilder, LoadBalancingPolicy,
    };
    use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
    use crate::policies::speculative_execution::{
        NoSpeculativeExecutionPolicy, SpeculativeExecutionPolicy,
    };

    /// `LocalOne`.
    pub fn consistency() -> Consistency {
        Consistency::LocalOne
    }

    /// `LocalSerial`.
    pub fn serial_consistency() -> Option<SerialConsistency> {
        Some(SerialConsistency::LocalSerial)
    }

    /// 12 seconds.
    pub fn request_timeout() -> Option<Duration> {
        Some(Duration::from_secs(12))
    }

    /// [DcAwareRoundRobinPolicy], with the local datacenter taken from the first known node that has one.
    pub fn load_balancing_policy() -> Arc<dyn LoadBalancingPolicy> {
        Arc::new(DcAwareRoundRobinPolicy::default())
    }

    /// [DefaultRetryPolicy].
    pub fn retry_policy() -> Arc<dyn RetryPolicy> {
        Arc::new(DefaultRetryPolicy::new())
    }

    /// [NoSpeculativeExecutionPolicy].
    pub fn speculative_execution_policy() -> Arc<dyn SpeculativeExecutionPolicy> {
        Arc::new(NoSpeculativeExecutionPolicy)
    }

    /// Token-aware routing is on.
    pub fn token_aware_routing() -> bool {
        true
    }

    /// Latency-aware routing is off.
    pub fn latency_awareness() -> Option<LatencyAwarenessBuilder> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ProfileSettings {
    request_timeout: Option<Option<Duration>>,
    consistency: Option<Consistency>,
    serial_consistency: Option<Option<SerialConsistency>>,
    load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    host_filter: Option<Option<HostFilter>>,
    token_aware_routing: Option<bool>,
    latency_awareness: Option<Option<LatencyAwarenessBuilder>>,
}

impl ProfileSettings {
    // Whether anything that goes into the load balancing chain is set.
    fn shapes_load_balancing(&self) -> bool {
        self.load_balancing_policy.is_some()
            || self.host_filter.is_some()
            || self.token_aware_routing.is_some()
            || self.latency_awareness.is_some()
    }
}

/// `ExecutionProfileBuilder` is used to create new `ExecutionProfile`s
/// # Example
///
/// ```
/// # use kestrel::client::ExecutionProfile;
/// # use kestrel::policies::retry::FallthroughRetryPolicy;
/// # use kestrel::statement::Consistency;
/// # use std::sync::Arc;
/// let profile: ExecutionProfile = ExecutionProfile::builder()
///     .consistency(Consistency::Three) // as this is the number we shall count to
///     .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
///     .build();
/// ```
#[derive(Clone, Debug, Default)]
pub struct ExecutionProfileBuilder {
    settings: ProfileSettings,
}

impl ExecutionProfileBuilder {
    /// Changes client-side timeout.
    /// The default is 12 seconds.
    /// If `None` is set, requests wait for the response indefinitely.
    ///
    /// # Example
    /// ```
    /// # use kestrel::client::ExecutionProfile;
    /// # use std::time::Duration;
    /// let profile: ExecutionProfile = ExecutionProfile::builder()
    ///     .request_timeout(Some(Duration::from_secs(5)))
    ///     .build();
    /// ```
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.request_timeout = Some(timeout);
        self
    }

    /// Specify a default consistency to be used for statements.
    /// Defaults to `LocalOne`.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.settings.consistency = Some(consistency);
        self
    }

    /// Specify a default serial consistency to be used for statements.
    /// Defaults to `LocalSerial`.
    pub fn serial_consistency(mut self, serial_consistency: Option<SerialConsistency>) -> Self {
        self.settings.serial_consistency = Some(serial_consistency);
        self
    }

    /// Sets the base load balancing policy.
    ///
    /// The policy actually used for requests wraps it according to
    /// [token_aware_routing](Self::token_aware_routing),
    /// [latency_awareness](Self::latency_awareness) and [host_filter](Self::host_filter).
    ///
    /// # Example
    /// ```
    /// # use kestrel::client::ExecutionProfile;
    /// # use kestrel::policies::load_balancing::RoundRobinPolicy;
    /// # use std::sync::Arc;
    /// let profile: ExecutionProfile = ExecutionProfile::builder()
    ///     .load_balancing_policy(Arc::new(RoundRobinPolicy::new()))
    ///     .build();
    /// ```
    pub fn load_balancing_policy(
        mut self,
        load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    ) -> Self {
        self.settings.load_balancing_policy = Some(load_balancing_policy);
        self
    }

    /// Sets the [`RetryPolicy`] to use by default on statements.
    /// The default is [DefaultRetryPolicy](crate::policies::retry::DefaultRetryPolicy).
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.settings.retry_policy = Some(retry_policy);
        self
    }

    /// Sets the speculative execution policy.
    /// The default is [NoSpeculativeExecutionPolicy](crate::policies::speculative_execution::NoSpeculativeExecutionPolicy).
    ///
    /// # Example
    /// ```
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// # use kestrel::client::ExecutionProfile;
    /// # use kestrel::policies::speculative_execution::ConstantSpeculativeExecutionPolicy;
    /// let policy = ConstantSpeculativeExecutionPolicy {
    ///     max_speculative_executions: 3,
    ///     delay: Duration::from_millis(100),
    /// };
    ///
    /// let profile: ExecutionProfile = ExecutionProfile::builder()
    ///     .speculative_execution_policy(Arc::new(policy))
    ///     .build();
    /// ```
    pub fn speculative_execution_policy(
        mut self,
        speculative_execution_policy: Arc<dyn SpeculativeExecutionPolicy>,
    ) -> Self {
        self.settings.speculative_execution_policy = Some(speculative_execution_policy);
        self
    }

    /// Restricts the nodes requests are sent to. `None` removes any filter inherited
    /// from the default profile.
    pub fn host_filter(mut self, host_filter: Option<HostFilter>) -> Self {
        self.settings.host_filter = Some(host_filter);
        self
    }

    /// Whether replicas of the request's token are tried first. On by default.
    pub fn token_aware_routing(mut self, enabled: bool) -> Self {
        self.settings.token_aware_routing = Some(enabled);
        self
    }

    /// Enables latency-aware routing with the given settings, or disables it with `None`.
    /// Off by default.
    pub fn latency_awareness(mut self, settings: Option<LatencyAwarenessBuilder>) -> Self {
        self.settings.latency_awareness = Some(settings);
        self
    }

    /// Builds the ExecutionProfile.
    pub fn build(self) -> ExecutionProfile {
        ExecutionProfile(Arc::new(self.settings))
    }
}

/// A set of request execution options, each of which may be left unset.
///
/// Execution profile is immutable as such. Once a session resolved it, it is reached through an
/// [ExecutionProfileHandle], which can be remapped to another profile.
#[derive(Debug, Clone, Default)]
pub struct ExecutionProfile(pub(crate) Arc<ProfileSettings>);

impl ExecutionProfile {
    /// Creates a blank builder that can be used to construct new ExecutionProfile.
    pub fn builder() -> ExecutionProfileBuilder {
        ExecutionProfileBuilder::default()
    }

    /// Creates a builder having all options set to the same as set in this ExecutionProfile.
    pub fn to_builder(&self) -> ExecutionProfileBuilder {
        ExecutionProfileBuilder {
            settings: (*self.0).clone(),
        }
    }

    /// Gets client timeout set on this profile.
    pub fn get_request_timeout(&self) -> Option<Option<Duration>> {
        self.0.request_timeout
    }

    /// Gets consistency set on this profile.
    pub fn get_consistency(&self) -> Option<Consistency> {
        self.0.consistency
    }

    /// Gets serial consistency set on this profile.
    pub fn get_serial_consistency(&self) -> Option<Option<SerialConsistency>> {
        self.0.serial_consistency
    }

    /// Gets the base load balancing policy set on this profile.
    pub fn get_load_balancing_policy(&self) -> Option<&Arc<dyn LoadBalancingPolicy>> {
        self.0.load_balancing_policy.as_ref()
    }

    /// Gets retry policy set on this profile.
    pub fn get_retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.0.retry_policy.as_ref()
    }

    /// Gets speculative execution policy set on this profile.
    pub fn get_speculative_execution_policy(
        &self,
    ) -> Option<&Arc<dyn SpeculativeExecutionPolicy>> {
        self.0.speculative_execution_policy.as_ref()
    }

    /// Gets host filter set on this profile.
    pub fn get_host_filter(&self) -> Option<Option<&HostFilter>> {
        self.0.host_filter.as_ref().map(Option::as_ref)
    }

    /// Gets the token-aware routing flag set on this profile.
    pub fn get_token_aware_routing(&self) -> Option<bool> {
        self.0.token_aware_routing
    }

    /// Gets the latency awareness settings set on this profile.
    pub fn get_latency_awareness(&self) -> Option<Option<&LatencyAwarenessBuilder>> {
        self.0.latency_awareness.as_ref().map(Option::as_ref)
    }

    /// A copy whose load balancing policy is a fresh instance, when the policy supports it.
    /// Retry and speculative execution policies stay shared.
    pub(crate) fn deep_copy(&self) -> ExecutionProfile {
        let mut settings = (*self.0).clone();
        if let Some(policy) = &settings.load_balancing_policy {
            if let Some(fresh) = policy.new_instance() {
                settings.load_balancing_policy = Some(fresh);
            }
        }
        ExecutionProfile(Arc::new(settings))
    }
}

/// A profile with every option filled in, and the load balancing chain built.
#[derive(Debug)]
pub(crate) struct ResolvedProfile {
    pub(crate) profile: ExecutionProfile,

    pub(crate) request_timeout: Option<Duration>,
    pub(crate) consistency: Consistency,
    pub(crate) serial_consistency: Option<SerialConsistency>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) speculative_execution_policy: Arc<dyn SpeculativeExecutionPolicy>,

    base_load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    host_filter: Option<HostFilter>,
    token_aware_routing: bool,
    latency_awareness: Option<LatencyAwarenessBuilder>,

    load_balancer: Arc<dyn LoadBalancingPolicy>,
    lb_initialized: Once,
}

impl ResolvedProfile {
    /// Fills the options unset on `profile` from `base`, or from [defaults] when there is no base.
    pub(crate) fn resolve(profile: ExecutionProfile, base: Option<&ResolvedProfile>) -> Self {
        let settings = &profile.0;

        let request_timeout = settings
            .request_timeout
            .or(base.map(|b| b.request_timeout))
            .unwrap_or_else(defaults::request_timeout);
        let consistency = settings
            .consistency
            .or(base.map(|b| b.consistency))
            .unwrap_or_else(defaults::consistency);
        let serial_consistency = settings
            .serial_consistency
            .or(base.map(|b| b.serial_consistency))
            .unwrap_or_else(defaults::serial_consistency);
        let retry_policy = settings
            .retry_policy
            .clone()
            .or_else(|| base.map(|b| b.retry_policy.clone()))
            .unwrap_or_else(defaults::retry_policy);
        let speculative_execution_policy = settings
            .speculative_execution_policy
            .clone()
            .or_else(|| base.map(|b| b.speculative_execution_policy.clone()))
            .unwrap_or_else(defaults::speculative_execution_policy);

        let base_load_balancing_policy = settings
            .load_balancing_policy
            .clone()
            .or_else(|| base.map(|b| b.base_load_balancing_policy.clone()))
            .unwrap_or_else(defaults::load_balancing_policy);
        let host_filter = settings
            .host_filter
            .clone()
            .or_else(|| base.map(|b| b.host_filter.clone()))
            .unwrap_or_default();
        let token_aware_routing = settings
            .token_aware_routing
            .or(base.map(|b| b.token_aware_routing))
            .unwrap_or_else(defaults::token_aware_routing);
        let latency_awareness = settings
            .latency_awareness
            .clone()
            .or_else(|| base.map(|b| b.latency_awareness.clone()))
            .unwrap_or_else(defaults::latency_awareness);

        let load_balancer = match base {
            Some(base) if !settings.shapes_load_balancing() => base.load_balancer.clone(),
            _ => build_load_balancer(
                base_load_balancing_policy.clone(),
                token_aware_routing,
                latency_awareness.clone(),
                host_filter.clone(),
            ),
        };
        debug!("Resolved execution profile with {}", load_balancer.name());

        ResolvedProfile {
            profile,
            request_timeout,
            consistency,
            serial_consistency,
            retry_policy,
            speculative_execution_policy,
            base_load_balancing_policy,
            host_filter,
            token_aware_routing,
            latency_awareness,
            load_balancer,
            lb_initialized: Once::new(),
        }
    }

    /// The load balancing chain, initialised with `cluster` on first use.
    pub(crate) fn load_balancer(&self, cluster: &ClusterState) -> &Arc<dyn LoadBalancingPolicy> {
        self.lb_initialized
            .call_once(|| self.load_balancer.init(cluster));
        &self.load_balancer
    }

    /// The chain, without initialising it.
    pub(crate) fn load_balancer_uninit(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.load_balancer
    }
}

// base, then token awareness, then latency awareness, then the host filter outermost.
fn build_load_balancer(
    base: Arc<dyn LoadBalancingPolicy>,
    token_aware_routing: bool,
    latency_awareness: Option<LatencyAwarenessBuilder>,
    host_filter: Option<HostFilter>,
) -> Arc<dyn LoadBalancingPolicy> {
    let mut chain = base;
    if token_aware_routing {
        chain = Arc::new(TokenAwarePolicy::new(chain));
    }
    if let Some(settings) = latency_awareness {
        chain = Arc::new(settings.build(chain));
    }
    if let Some(filter) = host_filter {
        chain = Arc::new(HostFilterPolicy::new(chain, filter));
    }
    chain
}

#[derive(Debug)]
struct HandleInner {
    current: ArcSwap<ResolvedProfile>,
    // What remapped profiles are resolved against; `None` for the default profile's handle.
    base: Option<Arc<ResolvedProfile>>,
    label: Option<String>,
}

/// A handle that points to a resolved execution profile of a session.
///
/// Its goal is to enable remapping all associated statements to another execution
/// profile at once.
/// Note: Cloned handles share the pointee: remapping one of them affects all the others.
#[derive(Debug, Clone)]
pub struct ExecutionProfileHandle(Arc<HandleInner>);

impl ExecutionProfileHandle {
    pub(crate) fn new(
        resolved: Arc<ResolvedProfile>,
        base: Option<Arc<ResolvedProfile>>,
        label: Option<String>,
    ) -> Self {
        ExecutionProfileHandle(Arc::new(HandleInner {
            current: ArcSwap::new(resolved),
            base,
            label,
        }))
    }

    pub(crate) fn access(&self) -> Arc<ResolvedProfile> {
        self.0.current.load_full()
    }

    /// The name of the profile the handle was created for, if any.
    pub fn label(&self) -> Option<&str> {
        self.0.label.as_deref()
    }

    /// Creates a builder having all options set to the same as set in the profile pointed by this handle.
    pub fn pointee_to_builder(&self) -> ExecutionProfileBuilder {
        self.0.current.load().profile.to_builder()
    }

    /// Returns execution profile pointed by this handle, as it was configured.
    pub fn to_profile(&self) -> ExecutionProfile {
        self.0.current.load().profile.clone()
    }

    /// Makes the handle point to a new execution profile.
    ///
    /// Unset options of `profile` are taken from the session's default profile.
    /// All statements holding this handle will reflect the change.
    pub fn map_to_another_profile(&self, profile: ExecutionProfile) {
        let resolved = ResolvedProfile::resolve(profile, self.0.base.as_deref());
        self.0.current.store(Arc::new(resolved))
    }

    /// The request timeout requests with this profile run with.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.0.current.load().request_timeout
    }

    /// The consistency requests with this profile run with, unless the statement sets one.
    pub fn consistency(&self) -> Consistency {
        self.0.current.load().consistency
    }

    /// The serial consistency requests with this profile run with, unless the statement sets one.
    pub fn serial_consistency(&self) -> Option<SerialConsistency> {
        self.0.current.load().serial_consistency
    }

    /// The retry policy in effect.
    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.0.current.load().retry_policy.clone()
    }

    /// The speculative execution policy in effect.
    pub fn speculative_execution_policy(&self) -> Arc<dyn SpeculativeExecutionPolicy> {
        self.0.current.load().speculative_execution_policy.clone()
    }

    /// The complete load balancing chain in effect, decorators included.
    pub fn load_balancing_policy(&self) -> Arc<dyn LoadBalancingPolicy> {
        self.0.current.load().load_balancer.clone()
    }
}
