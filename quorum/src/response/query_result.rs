use std::net::SocketAddr;

use bytes::Bytes;
use uuid::Uuid;

use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::response::result::{self, Rows};
use crate::Consistency;

/// The kind of RESULT the server answered with.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ResultKind {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(Bytes),
    SchemaChange(SchemaChangeEvent),
}

impl From<result::Result> for ResultKind {
    fn from(result: result::Result) -> Self {
        match result {
            result::Result::Void => ResultKind::Void,
            result::Result::Rows(rows) => ResultKind::Rows(rows),
            result::Result::SetKeyspace(sk) => ResultKind::SetKeyspace(sk.keyspace_name),
            result::Result::Prepared(prepared) => ResultKind::Prepared(prepared.id),
            result::Result::SchemaChange(sc) => ResultKind::SchemaChange(sc.event),
        }
    }
}

/// How a request was executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionInfo {
    /// Hosts the request was sent to, in order. The last one produced the result.
    pub hosts_tried: Vec<SocketAddr>,
    /// Consistency of the final attempt, which may differ from the requested one
    /// after a retry policy downgraded it.
    pub consistency: Consistency,
    /// Number of attempts made, across all hosts.
    pub attempts: usize,
    pub trace_id: Option<Uuid>,
}

/// Result of a single query, execution or batch.
///
/// Rows are returned raw: a column specification plus the serialized cells,
/// to be decoded by the caller.
#[derive(Debug, Clone)]
pub struct QueryResult {
    kind: ResultKind,
    warnings: Vec<String>,
    execution_info: ExecutionInfo,
}

impl QueryResult {
    pub(crate) fn new(kind: ResultKind, warnings: Vec<String>, execution_info: ExecutionInfo) -> Self {
        Self {
            kind,
            warnings,
            execution_info,
        }
    }

    pub fn kind(&self) -> &ResultKind {
        &self.kind
    }

    pub fn into_kind(self) -> ResultKind {
        self.kind
    }

    /// Returns true for a VOID result, which is also what an ignored failure resolves to.
    pub fn is_void(&self) -> bool {
        matches!(self.kind, ResultKind::Void)
    }

    pub fn rows(&self) -> Option<&Rows> {
        match &self.kind {
            ResultKind::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Rows> {
        match self.kind {
            ResultKind::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Warnings the server attached to the response.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }

    pub fn trace_id(&self) -> Option<Uuid> {
        self.execution_info.trace_id
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionInfo, QueryResult, ResultKind};
    use crate::frame::response::result::{self, Row, Rows, SetKeyspace};
    use crate::Consistency;

    fn info() -> ExecutionInfo {
        ExecutionInfo {
            hosts_tried: vec!["127.0.0.1:9042".parse().unwrap()],
            consistency: Consistency::One,
            attempts: 1,
            trace_id: None,
        }
    }

    #[test]
    fn rows_are_exposed_only_for_rows_results() {
        let rows = Rows {
            rows: vec![Row { columns: vec![None] }],
            ..Default::default()
        };
        let res = QueryResult::new(result::Result::Rows(rows).into(), Vec::new(), info());
        assert_eq!(res.rows().map(Rows::rows_count), Some(1));
        assert!(!res.is_void());

        let res = QueryResult::new(
            result::Result::SetKeyspace(SetKeyspace {
                keyspace_name: "ks".to_string(),
            })
            .into(),
            vec!["slow".to_string()],
            info(),
        );
        assert!(res.rows().is_none());
        assert_eq!(res.warnings().collect::<Vec<_>>(), vec!["slow"]);
        assert!(matches!(res.into_kind(), ResultKind::SetKeyspace(ks) if ks == "ks"));
    }
}
