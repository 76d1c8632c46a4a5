//! The result of a request, as handed to the caller.

use kestrel_cql::frame::response::result::{ColumnSpec, Row, Rows};
use uuid::Uuid;

use crate::observability::history::RequestHistory;
use crate::response::Coordinator;

/// Result of a single request to the database. It represents any kind of Result frame.
///
/// Rows are present only if the frame was of Result:Rows kind; their cells
/// are still in wire form and can be read with [`Row::get`].
#[derive(Debug, Clone)]
pub struct QueryResult {
    request_coordinator: Coordinator,
    rows: Option<Rows>,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
    history: Option<RequestHistory>,
}

impl QueryResult {
    pub(crate) fn new(
        request_coordinator: Coordinator,
        rows: Option<Rows>,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            request_coordinator,
            rows,
            tracing_id,
            warnings,
            history: None,
        }
    }

    pub(crate) fn with_history(mut self, history: Option<RequestHistory>) -> Self {
        self.history = history;
        self
    }

    /// The node that served the request.
    #[inline]
    pub fn request_coordinator(&self) -> &Coordinator {
        &self.request_coordinator
    }

    /// Returns `true` if the response was of Rows kind.
    #[inline]
    pub fn is_rows(&self) -> bool {
        self.rows.is_some()
    }

    /// The returned rows, if the response was of Rows kind.
    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_ref().map(|rows| rows.rows.as_slice())
    }

    /// Specification of the returned columns, if the response was of Rows kind.
    pub fn column_specs(&self) -> Option<&[ColumnSpec]> {
        self.rows
            .as_ref()
            .map(|rows| rows.metadata.col_specs.as_slice())
    }

    /// Takes the rows out of the result.
    pub fn into_rows(self) -> Option<Rows> {
        self.rows
    }

    /// Warnings emitted by the database.
    #[inline]
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    /// Tracing ID associated with this CQL request.
    #[inline]
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Hosts the request was sent to, attempt outcomes and retry decisions.
    ///
    /// Present for every result returned by the session.
    pub fn history(&self) -> Option<&RequestHistory> {
        self.history.as_ref()
    }
}
