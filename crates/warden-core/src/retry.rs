//! Bounded retries with exponential backoff.
//!
//! Used for connector calls (transient failures) and model-provider calls
//! (retryable failures). Only the final outcome and the attempt count are
//! reported back; individual attempts are logged, not audited.

use std::{thread, time::Duration};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each later retry.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, E, F, R>(&self, mut op: F, is_retryable: R) -> Attempted<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op(attempts) {
                Ok(value) => return Attempted { result: Ok(value), attempts },
                Err(err) if is_retryable(&err) && attempts <= self.max_retries => {
                    let delay = self.delay_for(attempts);
                    debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "retrying after failure");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => return Attempted { result: Err(err), attempts },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500))
    }
}

/// The outcome of a retried operation.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn delay_doubles_and_caps() {
        let mut policy = RetryPolicy::new(5, Duration::from_millis(100));
        policy.max_backoff = Duration::from_millis(350);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let outcome = policy.run(
            |attempt| if attempt < 3 { Err("busy") } else { Ok(attempt) },
            |_| true,
        );
        assert_eq!(outcome.result, Ok(3));
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn stops_when_retries_exhausted() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let outcome: super::Attempted<(), &str> = policy.run(|_| Err("busy"), |_| true);
        assert_eq!(outcome.result, Err("busy"));
        assert_eq!(outcome.attempts, 3, "one attempt plus two retries");
    }

    #[test]
    fn non_retryable_fails_immediately() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let outcome: super::Attempted<(), &str> = policy.run(|_| Err("denied"), |e| *e != "denied");
        assert_eq!(outcome.attempts, 1);
    }
}
