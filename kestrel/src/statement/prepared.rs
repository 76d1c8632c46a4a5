//! Defines [`PreparedStatement`], what a node handed back for a PREPARE.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use kestrel_cql::frame::response::result::{Prepared, PreparedMetadata};
use kestrel_cql::value::SerializedValues;

use crate::routing::partitioner::composite_routing_key;

/// A statement prepared on the cluster.
///
/// Obtained from [`Session::prepare`](crate::client::Session::prepare), already attached
/// to the returned [`Statement`](super::Statement). Statements carrying one are sent as
/// EXECUTE with the statement id instead of the CQL text.
///
/// # Statement repreparation
/// A node that lost its prepared statement cache (after a restart or a schema change)
/// answers EXECUTE with an UNPREPARED error. The driver then prepares the statement
/// again on the same connection and resends the EXECUTE; callers never see the error.
///
/// Cloning is cheap: all clones share one set of metadata.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    shared: Arc<PreparedShared>,
}

#[derive(Debug)]
struct PreparedShared {
    id: Bytes,
    contents: String,
    keyspace: Option<String>,
    metadata: PreparedMetadata,
    // Replaced when a node reports that the result metadata changed.
    result_metadata_id: ArcSwapOption<Bytes>,
}

impl PreparedStatement {
    pub(crate) fn new(prepared: Prepared, contents: String, keyspace: Option<String>) -> Self {
        Self {
            shared: Arc::new(PreparedShared {
                id: prepared.id,
                contents,
                keyspace,
                metadata: prepared.prepared_metadata,
                result_metadata_id: ArcSwapOption::new(prepared.result_metadata_id.map(Arc::new)),
            }),
        }
    }

    /// The id the node assigned to the statement.
    pub fn get_id(&self) -> &Bytes {
        &self.shared.id
    }

    /// The CQL text that was prepared.
    pub fn get_contents(&self) -> &str {
        &self.shared.contents
    }

    /// The keyspace the statement was prepared in, if it was sent with PREPARE.
    pub fn get_keyspace(&self) -> Option<&str> {
        self.shared.keyspace.as_deref()
    }

    /// Bind marker metadata, including which markers make up the partition key.
    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.shared.metadata
    }

    /// The result metadata id EXECUTE is sent with, on versions that carry one.
    pub fn get_result_metadata_id(&self) -> Option<Bytes> {
        self.shared
            .result_metadata_id
            .load()
            .as_deref()
            .cloned()
    }

    pub(crate) fn update_result_metadata_id(&self, result_metadata_id: Bytes) {
        self.shared
            .result_metadata_id
            .store(Some(Arc::new(result_metadata_id)));
    }

    /// Builds the routing key from the bound values at the partition key positions.
    ///
    /// Returns `None` when the node sent no partition key positions, or a position is
    /// unbound or null.
    pub(crate) fn compute_routing_key(&self, values: &SerializedValues) -> Option<Bytes> {
        let pk_indexes = &self.shared.metadata.pk_indexes;
        if pk_indexes.is_empty() {
            return None;
        }

        let values: Vec<_> = values.iter().collect();
        let components = pk_indexes
            .iter()
            .map(|&index| values.get(usize::from(index))?.as_value())
            .collect::<Option<Vec<&[u8]>>>()?;
        Some(composite_routing_key(components).into())
    }
}
