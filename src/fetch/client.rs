//! The fetch client: limiter-gated requests with retry and event publishing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::limiter::RateLimiterRegistry;
use super::retry::RetryPolicy;
use super::transport::{FetchRequest, FetchResponse, ReqwestTransport, Transport};
use crate::config::FetchPolicyConfig;
use crate::error::{IngestError, IngestResult, body_snippet};
use crate::telemetry::current_job_id;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What happened on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    /// Transient failure; another attempt follows after `next_delay`
    Retrying,
    /// Non-retryable client error
    Rejected,
    /// Transient failure with no retries left
    Exhausted,
    /// The limiter was closed before the attempt could start
    ShutDown,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::Retrying => "retrying",
            FetchOutcome::Rejected => "rejected",
            FetchOutcome::Exhausted => "exhausted",
            FetchOutcome::ShutDown => "shut_down",
        }
    }
}

/// Published once per attempt.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// Shared by every attempt of one `fetch` call
    pub request_id: Uuid,
    pub source: String,
    /// Job the request was made for, when issued from a run
    pub job_id: Option<i32>,
    /// Credential-like query values are masked
    pub url: String,
    /// 1-based
    pub attempt: u32,
    pub outcome: FetchOutcome,
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub next_delay: Option<Duration>,
    pub at: DateTime<Utc>,
}

/// Shared, job-agnostic HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    limiters: Arc<RateLimiterRegistry>,
    policy: RetryPolicy,
    events: broadcast::Sender<FetchEvent>,
}

struct AttemptFailure {
    status: Option<u16>,
    cause: String,
    hint: Option<Duration>,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, limiters: Arc<RateLimiterRegistry>) -> Self {
        let policy = RetryPolicy::from_config(limiters.policy());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            limiters,
            policy,
            events,
        }
    }

    /// Build a client over the reqwest transport with a fresh limiter registry.
    pub fn from_config(config: &FetchPolicyConfig) -> Result<Self, reqwest::Error> {
        let transport = Arc::new(ReqwestTransport::new(config)?);
        let limiters = Arc::new(RateLimiterRegistry::new(config.clone()));
        Ok(Self::new(transport, limiters))
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    /// Receive every attempt's [`FetchEvent`] from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FetchEvent> {
        self.events.subscribe()
    }

    /// Issue `request` under its source's limits, retrying transient failures.
    #[instrument(
        skip(self, request),
        fields(source = %request.source, url = %request.display_url(), job_id = ?current_job_id())
    )]
    pub async fn fetch(&self, request: &FetchRequest) -> IngestResult<FetchResponse> {
        let limiter = self.limiters.limiter_for(&request.source);
        let policy = self
            .policy
            .clone()
            .with_max_retries(limiter.limits().max_retries);
        let request_id = Uuid::new_v4();
        let job_id = current_job_id();
        let url = request.display_url();
        let event = |attempt, outcome, status, elapsed, next_delay| FetchEvent {
            request_id,
            source: request.source.clone(),
            job_id,
            url: url.clone(),
            attempt,
            outcome,
            status,
            elapsed,
            next_delay,
            at: Utc::now(),
        };
        let mut attempt: u32 = 0;
        let mut last_status = None;

        loop {
            let permit = match limiter.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.publish(event(
                        attempt + 1,
                        FetchOutcome::ShutDown,
                        None,
                        Duration::ZERO,
                        None,
                    ));
                    return Err(IngestError::TransientFetchFailure {
                        source_name: request.source.clone(),
                        attempts: attempt,
                        last_status,
                        cause: "fetch client shut down".to_string(),
                    });
                }
            };

            attempt += 1;
            let started = Instant::now();
            let result = self.transport.send(request).await;
            drop(permit);
            let elapsed = started.elapsed();

            let failure = match result {
                Ok(response) if response.is_success() => {
                    self.publish(event(
                        attempt,
                        FetchOutcome::Success,
                        Some(response.status),
                        elapsed,
                        None,
                    ));
                    return Ok(response);
                }
                Ok(response) if response.status == 429 || response.status >= 500 => {
                    let hint = response.retry_after(Utc::now());
                    if let Some(hint) = hint.filter(|hint| !policy.accepts_hint(*hint)) {
                        self.publish(event(
                            attempt,
                            FetchOutcome::Exhausted,
                            Some(response.status),
                            elapsed,
                            None,
                        ));
                        warn!(
                            status = response.status,
                            retry_after_secs = hint.as_secs(),
                            "Server asked for a longer wait than allowed"
                        );
                        return Err(IngestError::TransientFetchFailure {
                            source_name: request.source.clone(),
                            attempts: attempt,
                            last_status: Some(response.status),
                            cause: format!(
                                "HTTP {}: Retry-After of {}s exceeds the {}s limit",
                                response.status,
                                hint.as_secs(),
                                policy.max_retry_after.as_secs()
                            ),
                        });
                    }
                    if response.status == 429 {
                        if let Some(until) = hint.and_then(|hint| Instant::now().checked_add(hint)) {
                            limiter.defer_until(until).await;
                        }
                    }
                    AttemptFailure {
                        status: Some(response.status),
                        cause: format!(
                            "HTTP {}: {}",
                            response.status,
                            body_snippet(&response.body)
                        ),
                        hint,
                    }
                }
                Ok(response) => {
                    self.publish(event(
                        attempt,
                        FetchOutcome::Rejected,
                        Some(response.status),
                        elapsed,
                        None,
                    ));
                    warn!(status = response.status, "Request rejected by source");
                    return Err(IngestError::FetchRejected {
                        source_name: request.source.clone(),
                        status: response.status,
                        body_snippet: body_snippet(&response.body),
                    });
                }
                Err(err) => AttemptFailure {
                    status: None,
                    cause: err.to_string(),
                    hint: None,
                },
            };
            last_status = failure.status;

            if attempt > policy.max_retries {
                self.publish(event(
                    attempt,
                    FetchOutcome::Exhausted,
                    failure.status,
                    elapsed,
                    None,
                ));
                warn!(attempts = attempt, cause = %failure.cause, "Fetch retries exhausted");
                return Err(IngestError::TransientFetchFailure {
                    source_name: request.source.clone(),
                    attempts: attempt,
                    last_status: failure.status,
                    cause: failure.cause,
                });
            }

            let delay = policy.delay_for(attempt - 1, failure.hint);
            self.publish(event(
                attempt,
                FetchOutcome::Retrying,
                failure.status,
                elapsed,
                Some(delay),
            ));
            histogram!("fetch_backoff_seconds", "source" => request.source.clone())
                .record(delay.as_secs_f64());
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                cause = %failure.cause,
                "Retrying fetch after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn publish(&self, event: FetchEvent) {
        counter!(
            "fetch_attempts_total",
            "source" => event.source.clone(),
            "outcome" => event.outcome.as_str()
        )
        .increment(1);

        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
