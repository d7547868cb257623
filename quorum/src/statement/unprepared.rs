use std::time::Duration;

use super::{ExecutionOptions, SerializedValues};
use crate::Consistency;

/// **Unprepared** CQL statement, sent as text with its values.
#[derive(Debug, Clone)]
pub struct Statement {
    /// The CQL statement text.
    pub cql: String,
    pub values: SerializedValues,
    pub options: ExecutionOptions,
}

impl Statement {
    pub fn new(cql: impl Into<String>) -> Self {
        Self {
            cql: cql.into(),
            values: SerializedValues::new(),
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_values(mut self, values: SerializedValues) -> Self {
        self.values = values;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.options.consistency = Some(consistency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.options.tracing = Some(tracing);
        self
    }
}

impl From<&str> for Statement {
    fn from(cql: &str) -> Self {
        Statement::new(cql)
    }
}

impl From<String> for Statement {
    fn from(cql: String) -> Self {
        Statement::new(cql)
    }
}
