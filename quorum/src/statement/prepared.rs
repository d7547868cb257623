use bytes::Bytes;

use super::ExecutionOptions;
use crate::frame::response::result::{PreparedMetadata, ResultMetadata};

/// A statement prepared by the cluster, returned by `Dispatcher::prepare`.
///
/// The statement is prepared lazily on every other host it is executed on; hosts are
/// expected to hand out the same [`id`](Self::id) for the same statement.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    cql: String,
    id: Bytes,
    metadata: PreparedMetadata,
    result_metadata: ResultMetadata,
    /// Options used for every execution of this statement.
    pub options: ExecutionOptions,
}

impl PreparedStatement {
    pub(crate) fn new(
        cql: String,
        id: Bytes,
        metadata: PreparedMetadata,
        result_metadata: ResultMetadata,
    ) -> Self {
        Self {
            cql,
            id,
            metadata,
            result_metadata,
            options: ExecutionOptions::default(),
        }
    }

    pub fn cql(&self) -> &str {
        &self.cql
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    /// Describes the bind markers.
    pub fn metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    /// Describes the columns of the rows an execution returns.
    pub fn result_metadata(&self) -> &ResultMetadata {
        &self.result_metadata
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }
}
