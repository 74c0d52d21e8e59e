use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Exponential backoff with jitter:
///
/// ```text
/// wait(n) = min(max, base · 2ⁿ) · (1 + U[0, 0.1))
/// ```
///
/// Per-caller state; never shared between reconnect loops.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Reset after a success so the next failure starts from `base` again.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_wait(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32.checked_shl(self.attempts).unwrap_or(u32::MAX))
            .min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        exp.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.1))
    }

    /// Sleep for the next interval.  Returns false if cancelled first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let wait = self.next_wait();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_double_up_to_the_cap_with_bounded_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        let expected_bases = [100u64, 200, 400, 800, 1600, 2000, 2000];
        for base in expected_bases {
            let wait = backoff.next_wait().as_millis() as u64;
            assert!(
                wait >= base && wait < base + base / 10 + 1,
                "wait {wait}ms outside [{base}, {base} + 10%)"
            );
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        for _ in 0..5 {
            backoff.next_wait();
        }
        backoff.reset();
        let wait = backoff.next_wait().as_millis();
        assert!(wait < 111, "post-reset wait should be near base: {wait}ms");
    }

    #[test]
    fn attempt_overflow_saturates_at_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        backoff.attempts = u32::MAX;
        let wait = backoff.next_wait();
        assert!(wait <= Duration::from_millis(2200));
    }

    #[tokio::test]
    async fn wait_returns_false_on_cancellation() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!backoff.wait(&cancel).await);
    }
}
