use super::{ExecutionOptions, PreparedStatement, SerializedValues};

pub use crate::frame::request::batch::BatchType;

/// A statement of a [`Batch`].
#[derive(Debug, Clone)]
pub enum BatchEntry {
    /// Sent as text.
    Statement { cql: String },
    /// Sent by id; prepared first on hosts that do not know it yet.
    Prepared(PreparedStatement),
}

impl BatchEntry {
    pub fn cql(&self) -> &str {
        match self {
            BatchEntry::Statement { cql } => cql,
            BatchEntry::Prepared(prepared) => prepared.cql(),
        }
    }
}

/// Several statements applied together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub batch_type: BatchType,
    entries: Vec<(BatchEntry, SerializedValues)>,
    pub options: ExecutionOptions,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..Default::default()
        }
    }

    pub fn append_statement(&mut self, cql: impl Into<String>, values: SerializedValues) {
        self.entries
            .push((BatchEntry::Statement { cql: cql.into() }, values));
    }

    pub fn append_prepared(&mut self, prepared: &PreparedStatement, values: SerializedValues) {
        self.entries
            .push((BatchEntry::Prepared(prepared.clone()), values));
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = &(BatchEntry, SerializedValues)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
