//! Retry policy: capped exponential backoff with symmetric jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, thread_rng};

use crate::config::FetchPolicyConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Hints above this are not waited out
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchPolicyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
            max_retry_after: Duration::from_millis(config.max_retry_after_ms),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// `min(base * factor^retry, cap)` before jitter; `retry` counts from 0.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Backoff with up to `jitter_factor` of it added or removed at random.
    pub fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry).as_secs_f64();
        if self.jitter_factor <= 0.0 || delay == 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let spread = delay * self.jitter_factor;
        let offset = thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }

    /// Whether a server hint is short enough to wait out.
    pub fn accepts_hint(&self, hint: Duration) -> bool {
        hint <= self.max_retry_after
    }

    /// Delay before the next attempt: the jittered backoff, never shorter than
    /// a server-supplied hint.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let computed = self.jittered(retry);
        match hint {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FetchPolicyConfig::default())
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&Utc) - now;
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}
