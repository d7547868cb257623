use uuid::Uuid;

use crate::errors::RequestAttemptError;
use crate::frame::response::{result, Response};

pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) trace_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

// A QueryResponse carrying a RESULT, the only successful answer to QUERY, PREPARE,
// EXECUTE and BATCH.
pub(crate) struct NonErrorQueryResponse {
    pub(crate) result: result::Result,
    pub(crate) trace_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        match self.response {
            Response::Result(result) => Ok(NonErrorQueryResponse {
                result,
                trace_id: self.trace_id,
                warnings: self.warnings,
            }),
            Response::Error(error) => Err(RequestAttemptError::DbError(error.error, error.reason)),
            other => Err(RequestAttemptError::UnexpectedResponse(other.opcode())),
        }
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.result {
            result::Result::SetKeyspace(sk) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&result::SchemaChange> {
        match &self.result {
            result::Result::SchemaChange(sc) => Some(sc),
            _ => None,
        }
    }
}
