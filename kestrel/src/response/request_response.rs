use std::collections::HashMap;

use bytes::Bytes;
use kestrel_cql::frame::response::{result, NonErrorResponse, Response};
use uuid::Uuid;

use crate::errors::RequestAttemptError;
use crate::response::{Coordinator, QueryResult};

#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    // Not exposed to the user.
    #[allow(dead_code)]
    pub(crate) custom_payload: Option<HashMap<String, Bytes>>,
}

// A QueryResponse in which response can not be Response::Error
#[derive(Debug)]
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let response = self
            .response
            .into_non_error_response()
            .map_err(|err| RequestAttemptError::DbError(err.error, err.reason))?;
        Ok(NonErrorQueryResponse {
            response,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    /// Only RESULT responses make sense for a QUERY.
    pub(crate) fn into_query_result(
        self,
        coordinator: Coordinator,
    ) -> Result<QueryResult, RequestAttemptError> {
        let Self {
            response,
            tracing_id,
            warnings,
        } = self;

        let rows = match response {
            NonErrorResponse::Result(result::Result::Rows(rows)) => Some(rows),
            NonErrorResponse::Result(_) => None,
            other => return Err(RequestAttemptError::UnexpectedResponse(other.opcode())),
        };

        Ok(QueryResult::new(coordinator, rows, tracing_id, warnings))
    }
}
