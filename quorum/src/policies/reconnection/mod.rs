//! Reconnection policies produce the delays between attempts to reach a host again.
//!
//! Each reconnection round asks the policy for a fresh [`ReconnectionSchedule`]. The
//! schedule is consumed one delay per attempt; once it is exhausted the round gives up.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace};

use crate::errors::{ConnectionError, ReconnectionGaveUp};

mod constant;
mod exponential;

pub use constant::ConstantReconnectionPolicy;
pub use exponential::ExponentialReconnectionPolicy;

/// Single-use sequence of delays, one before each reconnection attempt.
pub type ReconnectionSchedule = Box<dyn Iterator<Item = Duration> + Send>;

pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    /// Starts a new schedule.
    fn schedule(&self) -> ReconnectionSchedule;
}

/// Calls `attempt` after each delay of `schedule` until it succeeds or the schedule runs out.
pub(crate) async fn reconnect_with_schedule<T, F, Fut>(
    address: SocketAddr,
    schedule: ReconnectionSchedule,
    mut attempt: F,
) -> Result<T, ReconnectionGaveUp>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    let mut attempts = 0;
    let mut last_error = None;

    for delay in schedule {
        trace!(node = %address, ?delay, "Scheduling reconnection attempt");
        tokio::time::sleep(delay).await;
        attempts += 1;

        match attempt().await {
            Ok(reconnected) => {
                debug!(node = %address, attempts, "Reconnected");
                return Ok(reconnected);
            }
            Err(error) => {
                debug!(node = %address, attempts, "Reconnection attempt failed: {}", error);
                last_error = Some(error);
            }
        }
    }

    Err(ReconnectionGaveUp {
        address,
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::{reconnect_with_schedule, ExponentialReconnectionPolicy, ReconnectionPolicy};
    use crate::errors::ConnectionError;
    use assert_matches::assert_matches;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn gives_up_once_the_schedule_is_exhausted() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .max_attempts(4);
        let address: SocketAddr = "10.0.0.1:9042".parse().unwrap();

        let start = Instant::now();
        let attempted_at = Arc::new(Mutex::new(Vec::new()));
        let result: Result<(), _> = reconnect_with_schedule(address, policy.schedule(), || {
            let attempted_at = attempted_at.clone();
            async move {
                attempted_at.lock().unwrap().push(start.elapsed().as_secs());
                Err(ConnectionError::ConnectTimeout)
            }
        })
        .await;

        // Delays of 1, 2, 4 and 8 seconds, and no fifth attempt.
        assert_eq!(*attempted_at.lock().unwrap(), vec![1, 3, 7, 15]);
        let gave_up = result.unwrap_err();
        assert_eq!(gave_up.attempts, 4);
        assert_eq!(gave_up.address, address);
        assert_matches!(gave_up.last_error, Some(ConnectionError::ConnectTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_first_success() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let mut failures_left = 2;
        let result = reconnect_with_schedule(
            "10.0.0.1:9042".parse().unwrap(),
            policy.schedule(),
            || {
                let fail = failures_left > 0;
                failures_left -= 1;
                async move {
                    if fail {
                        Err(ConnectionError::ConnectTimeout)
                    } else {
                        Ok("connected")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "connected");
    }
}
