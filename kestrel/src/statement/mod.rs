//! Defines the [`Statement`] type, which represents a CQL statement together with
//! its bound values and per-statement execution options.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kestrel_cql::value::{SerializationError, SerializeRow, SerializedValues};

use crate::client::ExecutionProfileHandle;
use crate::observability::history::HistoryListener;

mod prepared;
pub use prepared::PreparedStatement;

pub use kestrel_cql::{Consistency, SerialConsistency};

// Which execution profile a statement runs with. A handle takes precedence over a name.
#[derive(Debug, Clone)]
pub(crate) enum ProfileSelector {
    Name(String),
    Handle(ExecutionProfileHandle),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<Option<SerialConsistency>>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Option<Duration>>,

    pub(crate) history_listener: Option<Arc<dyn HistoryListener>>,

    pub(crate) execution_profile: Option<ProfileSelector>,
}

impl StatementConfig {
    /// Determines the consistency of a request
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}

/// A CQL statement, ready to be executed by a [`Session`](crate::client::Session).
///
/// Options left unset here are taken from the statement's execution profile.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    /// The CQL statement text.
    pub contents: String,
    values: SerializedValues,
    routing_key: Option<Bytes>,
    keyspace: Option<String>,
    page_size: Option<i32>,
    prepared: Option<PreparedStatement>,
}

impl Statement {
    /// Creates a new [`Statement`] from a CQL statement string.
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            config: Default::default(),
            contents: query_text.into(),
            values: SerializedValues::new(),
            routing_key: None,
            keyspace: None,
            page_size: None,
            prepared: None,
        }
    }

    /// Binds positional values, replacing the ones bound before.
    pub fn bind(mut self, values: &impl SerializeRow) -> Result<Self, SerializationError> {
        let mut serialized = SerializedValues::new();
        values.serialize_row(&mut serialized)?;
        self.values = serialized;
        Ok(self)
    }

    /// The bound values, in wire form.
    pub fn get_values(&self) -> &SerializedValues {
        &self.values
    }

    /// Sets the serialized partition key the request is routed by.
    /// Together with the keyspace it lets token-aware routing pick replicas.
    pub fn set_routing_key(&mut self, routing_key: Option<Bytes>) {
        self.routing_key = routing_key;
    }

    /// Returns self with the routing key set.
    pub fn with_routing_key(mut self, routing_key: impl Into<Bytes>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Gets the routing key.
    pub fn get_routing_key(&self) -> Option<&Bytes> {
        self.routing_key.as_ref()
    }

    // The key requests are routed by: the one set explicitly, else the one the
    // prepared statement builds from the bound partition key values.
    pub(crate) fn effective_routing_key(&self) -> Option<Bytes> {
        self.routing_key.clone().or_else(|| {
            self.prepared
                .as_ref()
                .and_then(|prepared| prepared.compute_routing_key(&self.values))
        })
    }

    /// The prepared statement this statement is executed as, if it was prepared
    /// with [`Session::prepare`](crate::client::Session::prepare).
    pub fn get_prepared(&self) -> Option<&PreparedStatement> {
        self.prepared.as_ref()
    }

    pub(crate) fn set_prepared(&mut self, prepared: PreparedStatement) {
        self.prepared = Some(prepared);
    }

    /// Sets the keyspace the statement operates on. It is used for routing, and sent
    /// with the request when the protocol version supports per-request keyspaces.
    pub fn set_keyspace(&mut self, keyspace: Option<String>) {
        self.keyspace = keyspace;
    }

    /// Returns self with the keyspace set.
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// Gets the keyspace.
    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// Sets the number of rows the server returns in one page.
    pub fn set_page_size(&mut self, page_size: Option<i32>) {
        self.page_size = page_size;
    }

    /// Gets the page size.
    pub fn get_page_size(&self) -> Option<i32> {
        self.page_size
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    /// Returns self with the consistency set.
    pub fn with_consistency(mut self, c: Consistency) -> Self {
        self.set_consistency(c);
        self
    }

    /// Unsets the consistency overridden on this statement.
    /// This means that consistency will be derived from the execution profile.
    pub fn unset_consistency(&mut self) {
        self.config.consistency = None;
    }

    /// Gets the consistency to be used when executing this statement if it is filled.
    /// If this is empty, the default consistency of the execution profile will be used.
    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Sets the serial consistency to be used when executing this statement.
    /// (Ignored unless the statement is an LWT)
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = Some(sc);
    }

    /// Unsets the serial consistency overridden on this statement.
    pub fn unset_serial_consistency(&mut self) {
        self.config.serial_consistency = None;
    }

    /// Gets the serial consistency to be used when executing this statement.
    /// `None` means it is taken from the execution profile.
    pub fn get_serial_consistency(&self) -> Option<Option<SerialConsistency>> {
        self.config.serial_consistency
    }

    /// Sets the idempotence of this statement
    /// A request is idempotent if it can be applied multiple times without changing the result of the initial application
    /// Only idempotent statements are executed speculatively, and
    /// retry policies may retry them after errors where the write may have been applied.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    /// Returns self marked as idempotent or not.
    pub fn with_idempotence(mut self, is_idempotent: bool) -> Self {
        self.set_is_idempotent(is_idempotent);
        self
    }

    /// Gets the idempotence of this statement
    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    /// Enable or disable CQL Tracing for this statement
    /// If enabled session.execute() will return a QueryResult containing tracing_id
    /// which can be used to query tracing information about the execution of this request
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    /// Gets whether tracing is enabled for this statement
    pub fn get_tracing(&self) -> bool {
        self.config.tracing
    }

    /// Sets the default timestamp for this statement in microseconds.
    /// If not None, it will replace the server side assigned timestamp as default timestamp
    /// If a statement contains a `USING TIMESTAMP` clause, calling this method won't change
    /// anything
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp
    }

    /// Gets the default timestamp for this statement in microseconds.
    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    /// Sets the client-side timeout for this statement.
    /// `Some(None)` disables the timeout; `None` takes it from the execution profile.
    pub fn set_request_timeout(&mut self, timeout: Option<Option<Duration>>) {
        self.config.request_timeout = timeout
    }

    /// Gets client timeout associated with this statement.
    pub fn get_request_timeout(&self) -> Option<Option<Duration>> {
        self.config.request_timeout
    }

    /// Sets a listener that is informed of every attempt, retry and speculative fiber of
    /// this statement's executions.
    pub fn set_history_listener(&mut self, history_listener: Arc<dyn HistoryListener>) {
        self.config.history_listener = Some(history_listener);
    }

    /// Removes the listener set by [`set_history_listener`](Self::set_history_listener).
    pub fn remove_history_listener(&mut self) -> Option<Arc<dyn HistoryListener>> {
        self.config.history_listener.take()
    }

    /// Runs the statement with the session's profile registered under `name`.
    /// An unknown name makes execution fail with a profile error.
    pub fn set_execution_profile(&mut self, name: impl Into<String>) {
        self.config.execution_profile = Some(ProfileSelector::Name(name.into()));
    }

    /// Returns self running with the named execution profile.
    pub fn with_execution_profile(mut self, name: impl Into<String>) -> Self {
        self.set_execution_profile(name);
        self
    }

    /// Associates the statement with execution profile referred by the provided handle.
    /// Handle may be later remapped to another profile, and statement will reflect those changes.
    pub fn set_execution_profile_handle(&mut self, profile_handle: Option<ExecutionProfileHandle>) {
        self.config.execution_profile = profile_handle.map(ProfileSelector::Handle);
    }

    /// The name of the execution profile the statement runs with, if it was chosen by name.
    pub fn get_execution_profile_name(&self) -> Option<&str> {
        match &self.config.execution_profile {
            Some(ProfileSelector::Name(name)) => Some(name),
            _ => None,
        }
    }

    /// Borrows the execution profile handle associated with this statement.
    pub fn get_execution_profile_handle(&self) -> Option<&ExecutionProfileHandle> {
        match &self.config.execution_profile {
            Some(ProfileSelector::Handle(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Runs the statement with the session's default execution profile.
    pub fn unset_execution_profile(&mut self) {
        self.config.execution_profile = None;
    }
}

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}
