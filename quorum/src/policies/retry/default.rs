use super::{RequestInfo, RetryDecision, RetryPolicy};
use crate::errors::WriteType;

/// The default retry policy, retrying at most once and only when the retry is likely to
/// succeed.
///
/// - A read timeout is retried at the same consistency if enough replicas answered but
///   the one asked for data did not.
/// - A write timeout is retried at the same consistency if it happened while writing the
///   batch log, which is safe to redo.
/// - Unavailable errors are returned to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn on_read_timeout(
        &self,
        request: &RequestInfo<'_>,
        required: i32,
        received: i32,
        data_present: bool,
    ) -> RetryDecision {
        if request.retries > 0 {
            return RetryDecision::Rethrow;
        }
        if received >= required && !data_present {
            RetryDecision::Retry(request.consistency)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        request: &RequestInfo<'_>,
        write_type: &WriteType,
        _required: i32,
        _received: i32,
    ) -> RetryDecision {
        if request.retries > 0 {
            return RetryDecision::Rethrow;
        }
        match write_type {
            WriteType::BatchLog => RetryDecision::Retry(request.consistency),
            _ => RetryDecision::Rethrow,
        }
    }

    fn on_unavailable(&self, _: &RequestInfo<'_>, _: i32, _: i32) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
