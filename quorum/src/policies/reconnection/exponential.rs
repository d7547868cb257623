use std::time::Duration;

use super::{ReconnectionPolicy, ReconnectionSchedule};

/// Delays growing geometrically from `start` by `exponent`, capped at `max`.
///
/// Without [`max_attempts`](Self::max_attempts) the schedule never ends.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    start: Duration,
    max: Duration,
    exponent: f64,
    max_attempts: Option<usize>,
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ExponentialReconnectionPolicy {
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            exponent: 2.0,
            max_attempts: None,
        }
    }

    /// Factor applied to each delay to get the next one. Defaults to 2.
    pub fn exponent(mut self, exponent: f64) -> Self {
        self.exponent = exponent;
        self
    }

    /// Gives up after this many attempts.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn schedule(&self) -> ReconnectionSchedule {
        let max = self.max;
        let exponent = self.exponent;
        let delays = std::iter::successors(Some(self.start.min(max)), move |delay| {
            Some(delay.mul_f64(exponent).min(max))
        });

        match self.max_attempts {
            Some(attempts) => Box::new(delays.take(attempts)),
            None => Box::new(delays),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ExponentialReconnectionPolicy;
    use crate::policies::reconnection::ReconnectionPolicy;
    use std::time::Duration;

    #[test]
    fn delays_grow_up_to_the_cap() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays = policy
            .schedule()
            .take(6)
            .map(|d| d.as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
    }

    #[test]
    fn every_schedule_starts_over() {
        let policy = ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
            .exponent(3.0)
            .max_attempts(3);

        let mut first = policy.schedule();
        first.next();
        let second = policy.schedule().collect::<Vec<_>>();
        assert_eq!(
            second,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(9)
            ]
        );
    }
}
