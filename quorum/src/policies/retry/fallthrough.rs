use super::{RequestInfo, RetryDecision, RetryPolicy};
use crate::errors::WriteType;

/// Never retries; every structured error is returned to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(&self, _: &RequestInfo<'_>, _: i32, _: i32, _: bool) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(
        &self,
        _: &RequestInfo<'_>,
        _: &WriteType,
        _: i32,
        _: i32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_unavailable(&self, _: &RequestInfo<'_>, _: i32, _: i32) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
