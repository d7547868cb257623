use tracing::debug;

use super::{RequestInfo, RetryDecision, RetryPolicy};
use crate::errors::WriteType;
use crate::Consistency;

/// Downgrading consistency retry policy - retries with a lower consistency level if it
/// knows that the requested one cannot be reached, trading consistency for availability.
///
/// At most one retry is made per request. Behaviour based on the
/// [DataStax Java Driver](<https://docs.datastax.com/en/drivers/java/3.11/com/datastax/driver/core/policies/DowngradingConsistencyRetryPolicy.html>).
#[derive(Debug, Clone, Copy, Default)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    pub fn new() -> Self {
        Self
    }

    // The highest consistency that `known_ok` replicas can satisfy.
    fn max_likely_to_work(
        &self,
        request: &RequestInfo<'_>,
        required: i32,
        known_ok: i32,
    ) -> RetryDecision {
        let consistency = if request.consistency == Consistency::All
            && required > 1
            && known_ok >= required / 2 + 1
        {
            Consistency::Quorum
        } else if known_ok >= 3 {
            Consistency::Three
        } else if known_ok == 2 {
            Consistency::Two
        } else if known_ok == 1 {
            Consistency::One
        } else {
            return RetryDecision::Rethrow;
        };

        debug!(
            statement = request.statement,
            "Lowering consistency from {} to {}", request.consistency, consistency
        );
        RetryDecision::Retry(consistency)
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn on_read_timeout(
        &self,
        request: &RequestInfo<'_>,
        required: i32,
        received: i32,
        data_present: bool,
    ) -> RetryDecision {
        if request.retries > 0 || request.consistency.is_serial() {
            return RetryDecision::Rethrow;
        }
        if received < required {
            self.max_likely_to_work(request, required, received)
        } else if data_present {
            RetryDecision::Rethrow
        } else {
            RetryDecision::Retry(request.consistency)
        }
    }

    fn on_write_timeout(
        &self,
        request: &RequestInfo<'_>,
        write_type: &WriteType,
        required: i32,
        received: i32,
    ) -> RetryDecision {
        if request.retries > 0 {
            return RetryDecision::Rethrow;
        }
        match write_type {
            // Some replica acknowledged it; the write will be propagated eventually.
            WriteType::Simple | WriteType::Batch => RetryDecision::Ignore,
            WriteType::UnloggedBatch => self.max_likely_to_work(request, required, received),
            WriteType::BatchLog => RetryDecision::Retry(request.consistency),
            _ => RetryDecision::Rethrow,
        }
    }

    fn on_unavailable(&self, request: &RequestInfo<'_>, required: i32, alive: i32) -> RetryDecision {
        if request.retries > 0 {
            return RetryDecision::Rethrow;
        }
        self.max_likely_to_work(request, required, alive)
    }
}

#[cfg(test)]
mod tests {
    use super::DowngradingConsistencyRetryPolicy;
    use crate::errors::WriteType;
    use crate::policies::retry::{RequestInfo, RetryDecision, RetryPolicy};
    use crate::Consistency;

    fn request(consistency: Consistency, retries: usize) -> RequestInfo<'static> {
        RequestInfo {
            statement: None,
            consistency,
            retries,
        }
    }

    #[test]
    fn unavailable_lowers_to_what_is_alive() {
        let policy = DowngradingConsistencyRetryPolicy::new();
        let quorum = request(Consistency::Quorum, 0);

        assert_eq!(
            policy.on_unavailable(&quorum, 5, 4),
            RetryDecision::Retry(Consistency::Three)
        );
        assert_eq!(
            policy.on_unavailable(&quorum, 3, 2),
            RetryDecision::Retry(Consistency::Two)
        );
        assert_eq!(
            policy.on_unavailable(&quorum, 2, 1),
            RetryDecision::Retry(Consistency::One)
        );
        assert_eq!(policy.on_unavailable(&quorum, 2, 0), RetryDecision::Rethrow);
        assert_eq!(
            policy.on_unavailable(&request(Consistency::Quorum, 1), 3, 2),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn all_falls_back_to_quorum_when_a_majority_is_alive() {
        let policy = DowngradingConsistencyRetryPolicy::new();
        let all = request(Consistency::All, 0);

        assert_eq!(
            policy.on_unavailable(&all, 3, 2),
            RetryDecision::Retry(Consistency::Quorum)
        );
        assert_eq!(
            policy.on_unavailable(&all, 5, 2),
            RetryDecision::Retry(Consistency::Two)
        );
    }

    #[test]
    fn read_timeouts() {
        let policy = DowngradingConsistencyRetryPolicy::new();
        let quorum = request(Consistency::Quorum, 0);

        assert_eq!(
            policy.on_read_timeout(&quorum, 3, 1, false),
            RetryDecision::Retry(Consistency::One)
        );
        assert_eq!(
            policy.on_read_timeout(&quorum, 2, 2, false),
            RetryDecision::Retry(Consistency::Quorum)
        );
        assert_eq!(
            policy.on_read_timeout(&quorum, 2, 2, true),
            RetryDecision::Rethrow
        );
        assert_eq!(
            policy.on_read_timeout(&request(Consistency::Serial, 0), 3, 1, false),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn write_timeouts_depend_on_the_write_type() {
        let policy = DowngradingConsistencyRetryPolicy::new();
        let quorum = request(Consistency::Quorum, 0);

        assert_eq!(
            policy.on_write_timeout(&quorum, &WriteType::Simple, 2, 1),
            RetryDecision::Ignore
        );
        assert_eq!(
            policy.on_write_timeout(&quorum, &WriteType::Batch, 2, 1),
            RetryDecision::Ignore
        );
        assert_eq!(
            policy.on_write_timeout(&quorum, &WriteType::UnloggedBatch, 3, 2),
            RetryDecision::Retry(Consistency::Two)
        );
        assert_eq!(
            policy.on_write_timeout(&quorum, &WriteType::BatchLog, 2, 0),
            RetryDecision::Retry(Consistency::Quorum)
        );
        assert_eq!(
            policy.on_write_timeout(&quorum, &WriteType::Counter, 2, 1),
            RetryDecision::Rethrow
        );
        assert_eq!(
            policy.on_write_timeout(&request(Consistency::Quorum, 1), &WriteType::Simple, 2, 1),
            RetryDecision::Rethrow
        );
    }
}
