//! What a request returns to the caller.

mod coordinator;
mod query_result;
mod request_response;

pub use coordinator::Coordinator;
pub use query_result::QueryResult;
pub(crate) use request_response::QueryResponse;
