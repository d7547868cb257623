//! Retry policies decide what to do when a server answers with a timeout or an
//! unavailable error.
//!
//! Only these three errors carry enough structure to reason about; every other server
//! error fails the request immediately, and transport failures are handled by moving on
//! to the next host of the plan. A [`RetryDecision::Retry`] resends the request to the
//! **same** host, possibly at a different consistency.

use crate::errors::{DbError, WriteType};
use crate::Consistency;

mod default;
mod downgrading_consistency;
mod fallthrough;

pub use default::DefaultRetryPolicy;
pub use downgrading_consistency::DowngradingConsistencyRetryPolicy;
pub use fallthrough::FallthroughRetryPolicy;

/// What the dispatcher should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again to the same host at the given consistency.
    Retry(Consistency),
    /// Pretend the request succeeded with a void result.
    Ignore,
    /// Fail the request with the server error.
    Rethrow,
}

/// Information about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Statement text; `None` for batches.
    pub statement: Option<&'a str>,
    /// Consistency the failed attempt was sent with.
    pub consistency: Consistency,
    /// How many times the request was already retried after a decision of this policy.
    pub retries: usize,
}

/// Decides what happens after a structured server error.
///
/// Policies are shared between all requests and must not keep per-request state; the
/// retry count is passed in [`RequestInfo::retries`].
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// The coordinator did not get enough replica responses to a read in time.
    fn on_read_timeout(
        &self,
        request: &RequestInfo<'_>,
        required: i32,
        received: i32,
        data_present: bool,
    ) -> RetryDecision;

    /// The coordinator did not get enough replica acknowledgements of a write in time.
    fn on_write_timeout(
        &self,
        request: &RequestInfo<'_>,
        write_type: &WriteType,
        required: i32,
        received: i32,
    ) -> RetryDecision;

    /// The coordinator knew upfront that too few replicas were alive.
    fn on_unavailable(&self, request: &RequestInfo<'_>, required: i32, alive: i32)
        -> RetryDecision;
}

/// Routes a server error to the matching callback. `None` means the error is not one a
/// retry policy can handle.
pub(crate) fn decide(
    policy: &dyn RetryPolicy,
    error: &DbError,
    request: &RequestInfo<'_>,
) -> Option<RetryDecision> {
    let decision = match error {
        DbError::ReadTimeout {
            received,
            required,
            data_present,
            ..
        } => policy.on_read_timeout(request, *required, *received, *data_present),
        DbError::WriteTimeout {
            write_type,
            received,
            required,
            ..
        } => policy.on_write_timeout(request, write_type, *required, *received),
        DbError::Unavailable {
            required, alive, ..
        } => policy.on_unavailable(request, *required, *alive),
        _ => return None,
    };
    Some(decision)
}
