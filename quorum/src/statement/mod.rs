//! Requests executed by the [`Dispatcher`](crate::Dispatcher).
//!
//! Bound values are handed in already encoded, as [`SerializedValues`].

use std::time::Duration;

use bytes::Bytes;

use crate::{Consistency, SerialConsistency};

mod batch;
mod prepared;
mod unprepared;

pub use crate::frame::value::SerializedValues;
pub use batch::{Batch, BatchEntry, BatchType};
pub use prepared::PreparedStatement;
pub use unprepared::Statement;

/// Settings of a single request.
///
/// Every field left unset takes the value of the dispatcher's default options
/// (see `DispatcherBuilder::default_execution_options`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub consistency: Option<Consistency>,
    /// Consistency of the Paxos phase of lightweight transactions.
    pub serial_consistency: Option<SerialConsistency>,
    pub page_size: Option<i32>,
    /// Where to resume a paged read, as returned in the metadata of the previous page.
    pub paging_state: Option<Bytes>,
    /// Time after which the request fails with a timeout. `Duration::ZERO` disables it.
    pub timeout: Option<Duration>,
    /// Asks the server to trace the request; the trace id is returned in the result.
    pub tracing: Option<bool>,
}

impl ExecutionOptions {
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn with_serial_consistency(mut self, serial_consistency: SerialConsistency) -> Self {
        self.serial_consistency = Some(serial_consistency);
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_paging_state(mut self, paging_state: Bytes) -> Self {
        self.paging_state = Some(paging_state);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.tracing = Some(tracing);
        self
    }

    /// Fills every unset field from `defaults`.
    pub(crate) fn or(&self, defaults: &ExecutionOptions) -> ExecutionOptions {
        ExecutionOptions {
            consistency: self.consistency.or(defaults.consistency),
            serial_consistency: self.serial_consistency.or(defaults.serial_consistency),
            page_size: self.page_size.or(defaults.page_size),
            paging_state: self
                .paging_state
                .clone()
                .or_else(|| defaults.paging_state.clone()),
            timeout: self.timeout.or(defaults.timeout),
            tracing: self.tracing.or(defaults.tracing),
        }
    }

    pub(crate) fn determine_consistency(&self) -> Consistency {
        self.consistency.unwrap_or_default()
    }

    pub(crate) fn determine_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionOptions;
    use crate::Consistency;
    use std::time::Duration;

    #[test]
    fn unset_options_fall_back_to_defaults() {
        let defaults = ExecutionOptions::default()
            .with_consistency(Consistency::Quorum)
            .with_timeout(Duration::from_secs(12))
            .with_tracing(false);
        let options = ExecutionOptions::default()
            .with_consistency(Consistency::One)
            .with_page_size(100)
            .or(&defaults);

        assert_eq!(options.determine_consistency(), Consistency::One);
        assert_eq!(options.page_size, Some(100));
        assert_eq!(options.determine_timeout(), Some(Duration::from_secs(12)));
        assert_eq!(options.tracing, Some(false));

        let disabled = ExecutionOptions::default()
            .with_timeout(Duration::ZERO)
            .or(&defaults);
        assert_eq!(disabled.determine_timeout(), None);
    }
}
