//! Cancellable, jittered exponential backoff for retry loops.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;

/// Retry state of one background loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures after a successful step.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, without jitter.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempt.min(63)).unwrap_or(63);
        #[allow(clippy::cast_precision_loss)]
        let raw = (self.cfg.initial_ms as f64) * self.cfg.multiplier.powi(exponent);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ms = if raw.is_finite() { raw as u64 } else { u64::MAX };
        Duration::from_millis(ms.max(self.cfg.initial_ms).min(self.cfg.max_ms))
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        if self.cfg.jitter <= 0.0 {
            return base;
        }
        let spread = rand::rng().random_range(-self.cfg.jitter..=self.cfg.jitter);
        base.mul_f64(1.0 + spread)
    }

    /// Sleep for the next delay unless `cancel` fires first.
    ///
    /// Returns `false` when cancelled.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn cfg(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn grows_and_caps() {
        let mut b = Backoff::new(cfg(0.0));
        let delays: Vec<u128> = (0..6).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut b = Backoff::new(cfg(0.2));
        for _ in 0..200 {
            b.reset();
            let d = b.next_delay().as_millis();
            assert!((79..=120).contains(&d), "delay {d} out of bounds");
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut b = Backoff::new(cfg(0.0));
        b.attempt = u32::MAX;
        assert_eq!(b.base_delay(), Duration::from_millis(1_000));
        b.next_delay();
        assert_eq!(b.attempt(), u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut b = Backoff::new(BackoffConfig::fixed(60_000));
        assert!(!b.wait(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_full_delay() {
        let cancel = CancellationToken::new();
        let mut b = Backoff::new(BackoffConfig::fixed(5_000));
        let started = tokio::time::Instant::now();
        assert!(b.wait(&cancel).await);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
