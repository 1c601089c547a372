use crate::config::ChatConfig;
use std::time::Duration;

/// How joins retry. Built from [`ChatConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            max_retries: config.max_join_retries,
            initial_delay: config.retry_delay(),
            backoff: config.retry_backoff,
            max_delay: config.connect_timeout(),
        }
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_attempts: self.max_retries + 1,
            next_delay: self.initial_delay.min(self.max_delay),
            backoff: self.backoff,
            max_delay: self.max_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryAfter(Duration),
    GiveUp,
}

/// Progress through one bounded sequence of connect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    /// Zero-based index of the attempt in flight.
    attempt: u32,
    max_attempts: u32,
    next_delay: Duration,
    backoff: f64,
    max_delay: Duration,
}

impl RetryState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }

    /// The attempt in flight timed out. The next one starts right away.
    pub fn on_timeout(&mut self) -> RetryDecision {
        if self.is_exhausted() {
            return RetryDecision::GiveUp;
        }
        self.attempt += 1;
        RetryDecision::RetryNow
    }

    /// The attempt in flight failed with an error. The back-off is capped by
    /// `budget`, what remained of this attempt's timeout, so an attempt never
    /// occupies more than one timeout window.
    pub fn on_error(&mut self, budget: Duration) -> RetryDecision {
        if self.is_exhausted() {
            return RetryDecision::GiveUp;
        }
        self.attempt += 1;
        let delay = self.next_delay.min(budget);
        self.next_delay = self.next_delay.mul_f64(self.backoff).min(self.max_delay);
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&ChatConfig::default())
    }

    #[test]
    fn test_timeouts_bounded_by_max_retries() {
        let mut state = policy().start();
        assert_eq!(state.max_attempts(), 3);
        assert_eq!(state.on_timeout(), RetryDecision::RetryNow);
        assert_eq!(state.on_timeout(), RetryDecision::RetryNow);
        assert_eq!(state.attempt(), 2);
        assert_eq!(state.on_timeout(), RetryDecision::GiveUp);
        assert_eq!(state.on_timeout(), RetryDecision::GiveUp);
        assert_eq!(state.attempt(), 2);
    }

    #[test]
    fn test_error_delay_grows() {
        let mut state = policy().start();
        let budget = Duration::from_secs(15);
        assert_eq!(
            state.on_error(budget),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            state.on_error(budget),
            RetryDecision::RetryAfter(Duration::from_secs(3))
        );
        assert_eq!(state.on_error(budget), RetryDecision::GiveUp);
    }

    #[test]
    fn test_error_delay_capped_by_budget() {
        let mut state = policy().start();
        assert_eq!(
            state.on_error(Duration::from_millis(500)),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let config = ChatConfig {
            max_join_retries: 0,
            ..ChatConfig::default()
        };
        let mut state = RetryPolicy::from_config(&config).start();
        assert!(state.is_exhausted());
        assert_eq!(state.on_error(Duration::from_secs(1)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_delay_never_exceeds_timeout() {
        let config = ChatConfig {
            connect_timeout_ms: 3_000,
            max_join_retries: 5,
            retry_backoff: 4.0,
            ..ChatConfig::default()
        };
        let mut state = RetryPolicy::from_config(&config).start();
        while let RetryDecision::RetryAfter(delay) = state.on_error(Duration::from_secs(60)) {
            assert!(delay <= Duration::from_secs(3));
        }
    }
}
