//! # Error Handling
//!
//! Unified error taxonomy for the ingestion core. Every failure that can end a
//! job maps to one [`IngestError`] variant with a stable snake_case kind code,
//! and [`IngestError::job_message`] renders the bounded text persisted on the
//! job record.

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

/// Upper bound on the persisted `error_message` length, in characters.
pub const MAX_JOB_MESSAGE_CHARS: usize = 512;

/// Convenience alias used across the crate.
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    /// Caller supplied a config the adapter rejected
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Retries against a source were exhausted
    #[error("{source_name} fetch failed after {attempts} attempts: {cause}")]
    TransientFetchFailure {
        source_name: String,
        attempts: u32,
        last_status: Option<u16>,
        cause: String,
    },

    /// Source answered with a non-retryable 4xx
    #[error("{source_name} rejected request with status {status}: {body_snippet}")]
    FetchRejected {
        source_name: String,
        status: u16,
        body_snippet: String,
    },

    /// Requested schema is incompatible with the recorded one
    #[error("schema conflict on {table_key}: {reason}")]
    SchemaConflict { table_key: String, reason: String },

    /// Write path failed after retries
    #[error("storage failure: {cause}")]
    StorageFailure { cause: String },

    /// Adapter declared a malformed dataset descriptor
    #[error("invalid descriptor for {table_key}: {reason}")]
    InvalidDescriptor { table_key: String, reason: String },

    /// A record does not match its table's declared fields
    #[error("invalid record for {table_key}: {reason}")]
    InvalidRecord { table_key: String, reason: String },

    #[error("unknown source '{name}'")]
    UnknownSource { name: String },

    /// Adapter emitted a batch for a table it never described
    #[error("batch emitted for undeclared table {table_key}")]
    UndeclaredTable { table_key: String },

    #[error("job cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("job exceeded maximum run time of {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("job {job_id} not found")]
    JobNotFound { job_id: i32 },

    /// Lifecycle operation not allowed from the job's current status
    #[error("cannot {action} job {job_id} in status {status}")]
    InvalidState {
        job_id: i32,
        status: String,
        action: String,
    },

    /// Adapter-specific failure (payload parsing and the like)
    #[error("adapter error: {0}")]
    Adapter(String),
}

impl IngestError {
    pub fn invalid_config<S: Into<String>>(reason: S) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn schema_conflict<K: Into<String>, S: Into<String>>(table_key: K, reason: S) -> Self {
        Self::SchemaConflict {
            table_key: table_key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_descriptor<K: Into<String>, S: Into<String>>(table_key: K, reason: S) -> Self {
        Self::InvalidDescriptor {
            table_key: table_key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_record<K: Into<String>, S: Into<String>>(table_key: K, reason: S) -> Self {
        Self::InvalidRecord {
            table_key: table_key.into(),
            reason: reason.into(),
        }
    }

    pub fn storage<S: Into<String>>(cause: S) -> Self {
        Self::StorageFailure {
            cause: cause.into(),
        }
    }

    pub fn adapter<S: Into<String>>(message: S) -> Self {
        Self::Adapter(message.into())
    }

    /// Stable machine-readable kind code.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::InvalidConfig { .. } => "invalid_config",
            IngestError::TransientFetchFailure { .. } => "transient_fetch_failure",
            IngestError::FetchRejected { .. } => "fetch_rejected",
            IngestError::SchemaConflict { .. } => "schema_conflict",
            IngestError::StorageFailure { .. } => "storage_failure",
            IngestError::InvalidDescriptor { .. } => "invalid_descriptor",
            IngestError::InvalidRecord { .. } => "invalid_record",
            IngestError::UnknownSource { .. } => "unknown_source",
            IngestError::UndeclaredTable { .. } => "undeclared_table",
            IngestError::Cancelled { .. } => "cancelled",
            IngestError::TimedOut { .. } => "timed_out",
            IngestError::JobNotFound { .. } => "job_not_found",
            IngestError::InvalidState { .. } => "invalid_state",
            IngestError::Adapter(_) => "adapter_error",
        }
    }

    /// Text stored in a failed job's `error_message`: kind plus short cause,
    /// truncated to [`MAX_JOB_MESSAGE_CHARS`].
    pub fn job_message(&self) -> String {
        let full = format!("{}: {}", self.kind(), self);
        if full.chars().count() <= MAX_JOB_MESSAGE_CHARS {
            return full;
        }
        let mut truncated: String = full.chars().take(MAX_JOB_MESSAGE_CHARS - 3).collect();
        truncated.push_str("...");
        truncated
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, IngestError::Cancelled { .. })
    }
}

impl From<DbErr> for IngestError {
    fn from(err: DbErr) -> Self {
        IngestError::StorageFailure {
            cause: err.to_string(),
        }
    }
}

/// Whether a database error is a connection-level failure worth retrying.
pub fn is_connection_error(error: &DbErr) -> bool {
    match error {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => matches!(
            sqlx_err,
            sea_orm::sqlx::Error::Io(_)
                | sea_orm::sqlx::Error::PoolTimedOut
                | sea_orm::sqlx::Error::PoolClosed
        ),
        _ => false,
    }
}

/// Truncate an upstream body for inclusion in error text.
pub fn body_snippet(body: &str) -> String {
    const LIMIT: usize = 200;
    if body.chars().count() <= LIMIT {
        body.to_string()
    } else {
        let mut snippet: String = body.chars().take(LIMIT).collect();
        snippet.push_str("...");
        snippet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(
            IngestError::invalid_config("missing start").kind(),
            "invalid_config"
        );
        assert_eq!(
            IngestError::schema_conflict("fred.rates", "dropped field").kind(),
            "schema_conflict"
        );
        assert_eq!(
            IngestError::Cancelled {
                reason: "requested".into()
            }
            .kind(),
            "cancelled"
        );
    }

    #[test]
    fn test_job_message_has_kind_prefix() {
        let err = IngestError::TransientFetchFailure {
            source_name: "fred".into(),
            attempts: 3,
            last_status: Some(503),
            cause: "HTTP 503".into(),
        };
        let message = err.job_message();
        assert!(message.starts_with("transient_fetch_failure: "));
        assert!(message.contains("fred"));
    }

    #[test]
    fn test_job_message_is_bounded() {
        let err = IngestError::adapter("x".repeat(5_000));
        let message = err.job_message();
        assert_eq!(message.chars().count(), MAX_JOB_MESSAGE_CHARS);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn test_db_err_maps_to_storage_failure() {
        let err: IngestError = DbErr::Custom("disk full".into()).into();
        assert_eq!(err.kind(), "storage_failure");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_body_snippet_truncates() {
        assert_eq!(body_snippet("short"), "short");
        let long = body_snippet(&"a".repeat(500));
        assert_eq!(long.chars().count(), 203);
    }
}
