//! Per-source concurrency caps and request pacing.
//!
//! One [`SourceLimiter`] exists per source for the life of the process. It is
//! shared by every job fetching from that source, so the caps hold globally
//! rather than per job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::config::{FetchPolicyConfig, SourceLimits};

/// Returned once the registry has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter closed")]
pub struct LimiterClosed;

/// Concurrency cap plus minimum start-to-start spacing for one source.
#[derive(Debug)]
pub struct SourceLimiter {
    source: String,
    limits: SourceLimits,
    semaphore: Arc<Semaphore>,
    /// Earliest instant the next request may start.
    next_slot: Mutex<Instant>,
}

impl SourceLimiter {
    pub fn new<S: Into<String>>(source: S, limits: SourceLimits) -> Self {
        Self {
            source: source.into(),
            semaphore: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
            limits,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn limits(&self) -> SourceLimits {
        self.limits
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a concurrency slot, then for the pacing slot. The returned
    /// permit must be held for the duration of the request.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, LimiterClosed> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        let start = {
            let mut next_slot = self.next_slot.lock().await;
            let start = (*next_slot).max(Instant::now());
            *next_slot = start + self.limits.min_interval;
            start
        };

        if start > Instant::now() {
            debug!(
                source = %self.source,
                wait_ms = (start - Instant::now()).as_millis() as u64,
                "Pacing request"
            );
            sleep_until(start).await;
        }

        Ok(permit)
    }

    /// Hold back every request of this source until `until`.
    pub async fn defer_until(&self, until: Instant) {
        let mut next_slot = self.next_slot.lock().await;
        if until > *next_slot {
            *next_slot = until;
        }
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

/// Process-wide table of source limiters, created at startup and injected into
/// the fetch client.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    policy: FetchPolicyConfig,
    limiters: RwLock<HashMap<String, Arc<SourceLimiter>>>,
    closed: AtomicBool,
}

impl RateLimiterRegistry {
    pub fn new(policy: FetchPolicyConfig) -> Self {
        Self {
            policy,
            limiters: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &FetchPolicyConfig {
        &self.policy
    }

    /// The limiter for `source`, created on first use.
    pub fn limiter_for(&self, source: &str) -> Arc<SourceLimiter> {
        if let Some(limiter) = self
            .limiters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(source)
        {
            return limiter.clone();
        }

        let mut limiters = self
            .limiters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        limiters
            .entry(source.to_string())
            .or_insert_with(|| {
                let limits = self.policy.limits_for(source);
                info!(
                    source,
                    max_concurrency = limits.max_concurrency,
                    min_interval_ms = limits.min_interval.as_millis() as u64,
                    "Created source rate limiter"
                );
                let limiter = SourceLimiter::new(source, limits);
                if self.closed.load(Ordering::SeqCst) {
                    limiter.close();
                }
                Arc::new(limiter)
            })
            .clone()
    }

    /// Close every source; pending and future acquisitions fail.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let limiters = self
            .limiters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for limiter in limiters.values() {
            limiter.close();
        }
        info!(sources = limiters.len(), "Rate limiters shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
