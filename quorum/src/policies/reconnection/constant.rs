use std::time::Duration;

use super::{ReconnectionPolicy, ReconnectionSchedule};

/// The same delay before every attempt.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    interval: Duration,
    max_attempts: Option<usize>,
}

impl ConstantReconnectionPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Gives up after this many attempts.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn schedule(&self) -> ReconnectionSchedule {
        let delays = std::iter::repeat(self.interval);
        match self.max_attempts {
            Some(attempts) => Box::new(delays.take(attempts)),
            None => Box::new(delays),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConstantReconnectionPolicy;
    use crate::policies::reconnection::ReconnectionPolicy;
    use std::time::Duration;

    #[test]
    fn repeats_the_interval() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_secs(5)).max_attempts(3);
        assert_eq!(
            policy.schedule().collect::<Vec<_>>(),
            vec![Duration::from_secs(5); 3]
        );
        assert_eq!(
            ConstantReconnectionPolicy::new(Duration::from_secs(5))
                .schedule()
                .take(100)
                .count(),
            100
        );
    }
}
