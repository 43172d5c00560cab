//! Test utilities for database and job testing.
//!
//! This module provides an in-memory SQLite database with migrations applied,
//! a scripted adapter whose runs are driven step by step from the test, and
//! helpers for inspecting materialized tables.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use ingestor::adapters::{
    Adapter, AdapterMetadata, AdapterRegistry, BatchEmitter, FetchContext, JobConfig,
};
use ingestor::config::{FetchPolicyConfig, JobRunnerConfig, UpsertConfig};
use ingestor::fetch::FetchClient;
use ingestor::models::job::Model as JobModel;
use ingestor::schema::{
    DatasetDescriptor, FieldSpec, FieldValue, RecordBatch, SemanticType, TableKey, record,
};
use ingestor::{IngestError, IngestResult, JobManager};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use tokio::sync::Notify;

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool holds a single connection so every query sees the same memory
/// database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(opt).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

/// Fetch policy without pacing and with millisecond backoff.
pub fn fast_fetch_policy() -> FetchPolicyConfig {
    FetchPolicyConfig {
        min_interval_ms: 0,
        base_delay_ms: 1,
        max_delay_ms: 10,
        max_retries: 2,
        ..FetchPolicyConfig::default()
    }
}

pub fn job_runner_config() -> JobRunnerConfig {
    JobRunnerConfig {
        worker_concurrency: 2,
        poll_interval_ms: 100,
        max_run_seconds: 30,
        batch_queue_depth: 2,
    }
}

/// Builds a manager over `db` with `adapters` and a real (unused) HTTP client.
pub fn build_manager(
    db: DatabaseConnection,
    adapters: AdapterRegistry,
    jobs: &JobRunnerConfig,
) -> JobManager {
    let fetch = FetchClient::from_config(&fast_fetch_policy()).expect("http client builds");
    JobManager::new(db, adapters, fetch, jobs, &UpsertConfig::default())
}

/// Registers `adapter` under its own source name and builds a manager.
pub fn manager_for(db: DatabaseConnection, adapter: Arc<ScriptedAdapter>) -> JobManager {
    manager_with_config(db, adapter, &job_runner_config())
}

pub fn manager_with_config(
    db: DatabaseConnection,
    adapter: Arc<ScriptedAdapter>,
    jobs: &JobRunnerConfig,
) -> JobManager {
    let mut adapters = AdapterRegistry::new();
    adapters.register(
        adapter.clone(),
        AdapterMetadata::new(adapter.source.clone(), "scripted test adapter"),
    );
    build_manager(db, adapters, jobs)
}

/// One scripted action of an adapter run.
pub enum Step {
    Emit(TableKey, RecordBatch),
    Fail(IngestError),
    /// Wake the test once everything before this step was emitted.
    Signal(Arc<Notify>),
    /// Block until the test wakes this step.
    Await(Arc<Notify>),
    /// Return a cancellation error once the job's token fires.
    WaitForCancel,
    /// Never finish.
    Hang,
    /// Panic inside `fetch`.
    Panic(&'static str),
}

/// Adapter whose `describe` and `fetch` behavior is set by the test.
pub struct ScriptedAdapter {
    pub source: String,
    descriptors: Mutex<Vec<DatasetDescriptor>>,
    runs: Mutex<VecDeque<Vec<Step>>>,
}

impl ScriptedAdapter {
    pub fn new(source: &str, descriptors: Vec<DatasetDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            source: source.to_string(),
            descriptors: Mutex::new(descriptors),
            runs: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue the steps of the next `fetch` call.
    pub fn push_run(&self, steps: Vec<Step>) {
        self.runs.lock().unwrap().push_back(steps);
    }

    pub fn set_descriptors(&self, descriptors: Vec<DatasetDescriptor>) {
        *self.descriptors.lock().unwrap() = descriptors;
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn validate(&self, config: &JobConfig) -> IngestResult<()> {
        if config.get("reject").and_then(|v| v.as_bool()) == Some(true) {
            return Err(IngestError::invalid_config("rejected by test adapter"));
        }
        Ok(())
    }

    async fn describe(
        &self,
        _config: &JobConfig,
        _ctx: &FetchContext,
    ) -> IngestResult<Vec<DatasetDescriptor>> {
        Ok(self.descriptors.lock().unwrap().clone())
    }

    async fn fetch(
        &self,
        _config: &JobConfig,
        ctx: &FetchContext,
        emit: BatchEmitter,
    ) -> IngestResult<()> {
        let steps = self.runs.lock().unwrap().pop_front().unwrap_or_default();
        for step in steps {
            match step {
                Step::Emit(key, batch) => emit.emit(&key, batch).await?,
                Step::Fail(err) => return Err(err),
                Step::Signal(notify) => notify.notify_one(),
                Step::Await(notify) => notify.notified().await,
                Step::WaitForCancel => {
                    ctx.cancel.cancelled().await;
                    return Err(IngestError::Cancelled {
                        reason: "adapter observed cancellation".to_string(),
                    });
                }
                Step::Hang => std::future::pending::<()>().await,
                Step::Panic(message) => panic!("{message}"),
            }
        }
        Ok(())
    }
}

pub fn rates_key() -> TableKey {
    TableKey::new("fred", "interest_rates")
}

/// `fred.interest_rates`: series_id text, date date, value decimal (nullable),
/// keyed by (series_id, date).
pub fn rates_descriptor() -> DatasetDescriptor {
    DatasetDescriptor::new(rates_key())
        .field(FieldSpec::required("series_id", SemanticType::Text))
        .field(FieldSpec::required("date", SemanticType::Date))
        .field(FieldSpec::optional("value", SemanticType::Decimal))
        .with_conflict_key(["series_id", "date"])
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, d).unwrap()
}

pub fn rate(series: &str, date: NaiveDate, value: f64) -> ingestor::schema::Record {
    record([
        ("series_id", FieldValue::from(series)),
        ("date", FieldValue::Date(date)),
        ("value", FieldValue::Decimal(value)),
    ])
}

/// `n` consecutive daily observations starting 2020-01-01.
pub fn daily_rates(series: &str, n: i64, value: f64) -> RecordBatch {
    let start = day(1);
    (0..n)
        .map(|i| rate(series, start + chrono::Duration::days(i), value))
        .collect()
}

pub async fn count_rows(db: &DatabaseConnection, table: &str) -> Result<i64> {
    let row = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            format!("SELECT COUNT(*) AS n FROM {table}"),
        ))
        .await?
        .expect("count row");
    Ok(row.try_get::<i64>("", "n")?)
}

/// `(series_id, date, value)` rows of a rates-shaped table, ordered by key.
pub async fn rate_rows(
    db: &DatabaseConnection,
    table: &str,
) -> Result<Vec<(String, NaiveDate, Option<f64>)>> {
    let rows = db
        .query_all(Statement::from_string(
            db.get_database_backend(),
            format!("SELECT series_id, date, value FROM {table} ORDER BY series_id, date"),
        ))
        .await?;
    rows.into_iter()
        .map(|row| {
            Ok((
                row.try_get::<String>("", "series_id")?,
                row.try_get::<NaiveDate>("", "date")?,
                row.try_get::<Option<f64>>("", "value")?,
            ))
        })
        .collect()
}

/// Column names of `table` in declaration order.
pub async fn table_columns(db: &DatabaseConnection, table: &str) -> Result<Vec<String>> {
    let rows = db
        .query_all(Statement::from_string(
            db.get_database_backend(),
            format!("PRAGMA table_info({table})"),
        ))
        .await?;
    rows.into_iter()
        .map(|row| Ok(row.try_get::<String>("", "name")?))
        .collect()
}

/// Polls `job_id` until `check` holds or five seconds pass.
pub async fn wait_for_job<F>(manager: &JobManager, job_id: i32, check: F) -> JobModel
where
    F: Fn(&JobModel) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = manager.get(job_id).await.expect("job exists");
        if check(&job) {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for job {job_id}; last seen {job:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
