//! Jittered exponential backoff for transient task failures.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the raw delay applied as uniform jitter in both directions.
    pub jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// `min(base * 2^(retry - 1), cap)`, with retry counts below 1 treated as 1.
    pub fn raw_delay(&self, retry: u32) -> Duration {
        let exponent = retry.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Raw delay plus uniform jitter in `[-jitter * raw, +jitter * raw]`,
    /// floored at zero.
    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let raw = self.raw_delay(retry).as_secs_f64();
        let spread = raw * self.jitter;
        if spread <= 0.0 {
            return Duration::from_secs_f64(raw);
        }
        let jittered = raw + rng.gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
