//! Results of executed requests.

mod query_result;
mod request_response;

pub use query_result::{ExecutionInfo, QueryResult, ResultKind};
pub(crate) use request_response::{NonErrorQueryResponse, QueryResponse};
