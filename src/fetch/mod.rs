//! # Fetch Client
//!
//! Outbound HTTP for adapters. Requests run under a per-source concurrency cap
//! and pacing interval shared by every job, transient failures are retried with
//! jittered exponential backoff, and server retry hints are honored.

pub mod client;
pub mod limiter;
pub mod retry;
pub mod transport;

pub use client::{FetchClient, FetchEvent, FetchOutcome};
pub use limiter::{LimiterClosed, RateLimiterRegistry, SourceLimiter};
pub use retry::{RetryPolicy, parse_retry_after};
pub use transport::{
    FetchRequest, FetchResponse, ReqwestTransport, Transport, TransportError, redact_url,
};
