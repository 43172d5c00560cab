//! # Job Manager
//!
//! Owns the lifecycle of ingestion runs. A run moves a job from `pending` to
//! `running`, asks the adapter to describe its tables, materializes them, and
//! streams the adapter's batches through the upsert engine until the adapter
//! is exhausted, fails, is cancelled or exceeds its time budget.
//!
//! Cancellation and the run deadline are observed only between batches, so a
//! chunk write is never interrupted. Every chunk commits on its own, together
//! with the matching `rows_inserted` increment.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use sea_orm::DatabaseConnection;
use serde_json::Value as JsonValue;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AdapterRegistry, BatchEmitter, EmittedBatch, FetchContext, JobConfig};
use crate::config::{JobRunnerConfig, UpsertConfig};
use crate::error::{IngestError, IngestResult};
use crate::fetch::FetchClient;
use crate::materializer::{SchemaMaterializer, TableHandle};
use crate::models::job::{JobStatus, Model as JobModel};
use crate::repositories::{DatasetRegistry, JobFilter, JobRepository};
use crate::schema::TableKey;
use crate::telemetry::{JobContext, with_job_context};
use crate::upsert::{JobRowCounter, UpsertEngine};

const CANCEL_REASON: &str = "cancellation requested";
const FINISH_RETRIES: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(200);

fn cancelled() -> IngestError {
    IngestError::Cancelled {
        reason: CANCEL_REASON.to_string(),
    }
}

/// Entry point for submitting, running and observing ingestion jobs.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: JobRepository,
    registry: DatasetRegistry,
    adapters: Arc<AdapterRegistry>,
    fetch: FetchClient,
    materializer: SchemaMaterializer,
    upsert: UpsertEngine,
    config: JobRunnerConfig,
    /// Cancellation tokens of jobs owned by this process, from spawn/run until finish.
    running: Mutex<HashMap<i32, CancellationToken>>,
    workers: Arc<Semaphore>,
}

/// Removes a job's token from the running table when the run ends, however it ends.
struct TokenGuard {
    inner: Arc<Inner>,
    job_id: i32,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.inner.tokens().remove(&self.job_id);
    }
}

impl Inner {
    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<i32, CancellationToken>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to a job running on the worker pool.
pub struct JobHandle {
    job_id: i32,
    manager: JobManager,
    task: JoinHandle<IngestResult<JobModel>>,
}

impl JobHandle {
    pub fn job_id(&self) -> i32 {
        self.job_id
    }

    /// Request cancellation; the run stops at its next batch boundary.
    pub async fn cancel(&self) -> IngestResult<()> {
        self.manager.cancel(self.job_id).await
    }

    /// Wait for the run to end and return the final job record. A task that
    /// died without finishing its job leaves the job `failed`.
    pub async fn join(self) -> IngestResult<JobModel> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                let failure = IngestError::adapter(format!("job task {}", task_failure(err)));
                error!(job_id = self.job_id, error = %failure, "Job task died");
                self.manager.abandon(self.job_id, &failure).await;
                self.manager.get(self.job_id).await
            }
        }
    }
}

impl JobManager {
    pub fn new(
        db: DatabaseConnection,
        adapters: AdapterRegistry,
        fetch: FetchClient,
        jobs_config: &JobRunnerConfig,
        upsert_config: &UpsertConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(jobs_config.worker_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                jobs: JobRepository::new(db.clone()),
                registry: DatasetRegistry::new(db.clone()),
                adapters: Arc::new(adapters),
                fetch,
                materializer: SchemaMaterializer::new(db.clone()),
                upsert: UpsertEngine::new(db, upsert_config),
                config: jobs_config.clone(),
                running: Mutex::new(HashMap::new()),
                workers,
            }),
        }
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.inner.adapters
    }

    pub fn fetch_client(&self) -> &FetchClient {
        &self.inner.fetch
    }

    /// Validate `config` with the source's adapter and persist a pending job.
    /// Nothing is stored when validation fails.
    #[instrument(skip(self, config))]
    pub async fn submit(&self, source: &str, config: JsonValue) -> IngestResult<i32> {
        let adapter = self.inner.adapters.get(source)?;
        let parsed = parse_config(&config)?;
        adapter.validate(&parsed)?;

        let job = self.inner.jobs.create(source, config).await?;
        Ok(job.id)
    }

    /// Snapshot of a job. Never waits on an in-flight run.
    pub async fn get(&self, job_id: i32) -> IngestResult<JobModel> {
        self.inner
            .jobs
            .find(job_id)
            .await?
            .ok_or(IngestError::JobNotFound { job_id })
    }

    pub async fn list(&self, filter: &JobFilter) -> IngestResult<Vec<JobModel>> {
        self.inner.jobs.list(filter).await
    }

    /// Ids of jobs this process currently owns.
    pub fn running_jobs(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.inner.tokens().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Best-effort cancellation. A job owned by this process stops at its next
    /// batch boundary; a pending job that never started is failed right away.
    /// Either way it ends `failed` with a cancellation reason.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: i32) -> IngestResult<()> {
        if self.signal_cancel(job_id) {
            return Ok(());
        }

        let job = self.get(job_id).await?;
        match job.job_status() {
            JobStatus::Pending => {
                if self
                    .inner
                    .jobs
                    .fail_pending(job_id, cancelled().job_message())
                    .await?
                {
                    info!("Pending job cancelled before it started");
                    counter!(
                        "jobs_finished_total",
                        "source" => job.source.clone(),
                        "status" => JobStatus::Failed.as_str()
                    )
                    .increment(1);
                    return Ok(());
                }
                // Lost a race with a starting run.
                if self.signal_cancel(job_id) {
                    return Ok(());
                }
                let current = self.get(job_id).await?;
                Err(invalid_state(&current, "cancel"))
            }
            _ => Err(invalid_state(&job, "cancel")),
        }
    }

    fn signal_cancel(&self, job_id: i32) -> bool {
        match self.inner.tokens().get(&job_id) {
            Some(token) => {
                token.cancel();
                info!(job_id, "Cancellation signalled to running job");
                true
            }
            None => false,
        }
    }

    fn claim_token(&self, job_id: i32) -> IngestResult<(CancellationToken, TokenGuard)> {
        let mut tokens = self.inner.tokens();
        if tokens.contains_key(&job_id) {
            return Err(IngestError::InvalidState {
                job_id,
                status: JobStatus::Running.as_str().to_string(),
                action: "run".to_string(),
            });
        }
        let token = CancellationToken::new();
        tokens.insert(job_id, token.clone());
        Ok((
            token,
            TokenGuard {
                inner: self.inner.clone(),
                job_id,
            },
        ))
    }

    /// Run a pending job to completion on the current task and return its
    /// final record. Job failures are recorded on the job, not returned.
    pub async fn run(&self, job_id: i32) -> IngestResult<JobModel> {
        let (token, _guard) = self.claim_token(job_id)?;
        self.run_claimed(job_id, token).await
    }

    /// Run a pending job on the worker pool.
    pub fn spawn(&self, job_id: i32) -> IngestResult<JobHandle> {
        let (token, guard) = self.claim_token(job_id)?;
        let manager = self.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = manager.inner.workers.clone().acquire_owned() => permit.ok(),
            };

            match permit {
                Some(_permit) => manager.run_claimed(job_id, token).await,
                None => {
                    // Cancelled while queued for a worker.
                    manager
                        .inner
                        .jobs
                        .fail_pending(job_id, cancelled().job_message())
                        .await?;
                    manager.get(job_id).await
                }
            }
        });

        Ok(JobHandle {
            job_id,
            manager: self.clone(),
            task,
        })
    }

    #[instrument(skip(self, token))]
    async fn run_claimed(&self, job_id: i32, token: CancellationToken) -> IngestResult<JobModel> {
        let job = self.get(job_id).await?;
        if job.job_status() != JobStatus::Pending || !self.inner.jobs.mark_running(job_id).await? {
            let current = self.get(job_id).await?;
            return Err(invalid_state(&current, "run"));
        }

        info!(source = %job.source, "Job started");
        let started = Instant::now();
        // Adapter code runs on its own task so a panic fails the job instead
        // of stranding it in `running`.
        let runner = self.clone();
        let run_job = job.clone();
        let run_token = token.clone();
        let outcome = tokio::spawn(with_job_context(JobContext { job_id }, async move {
            runner.execute(&run_job, &run_token).await
        }))
        .await
        .unwrap_or_else(|err| Err(IngestError::adapter(format!("run {}", task_failure(err)))));

        let (status, message) = match &outcome {
            Ok(()) => (JobStatus::Success, None),
            Err(err) => (JobStatus::Failed, Some(err.job_message())),
        };
        if !self.record_finish(job_id, status, message).await? {
            warn!("Job was no longer running when finishing");
        }

        counter!(
            "jobs_finished_total",
            "source" => job.source.clone(),
            "status" => status.as_str()
        )
        .increment(1);

        let finished = self.get(job_id).await?;
        match &outcome {
            Ok(()) => info!(
                rows_inserted = finished.rows_inserted,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job succeeded"
            ),
            Err(err) => warn!(
                rows_inserted = finished.rows_inserted,
                kind = err.kind(),
                error = %err,
                "Job failed"
            ),
        }
        Ok(finished)
    }

    /// `finish`, retried so a brief storage outage does not strand the job.
    async fn record_finish(
        &self,
        job_id: i32,
        status: JobStatus,
        message: Option<String>,
    ) -> IngestResult<bool> {
        let mut delay = FINISH_RETRY_DELAY;
        let mut attempt = 0;
        loop {
            match self.inner.jobs.finish(job_id, status, message.clone()).await {
                Ok(applied) => return Ok(applied),
                Err(err) if attempt < FINISH_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %err, "Recording job outcome failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    error!(error = %err, "Could not record job outcome");
                    return Err(err);
                }
            }
        }
    }

    /// Fail a job whose run ended without recording an outcome.
    async fn abandon(&self, job_id: i32, failure: &IngestError) {
        let message = failure.job_message();
        let recorded = match self
            .record_finish(job_id, JobStatus::Failed, Some(message.clone()))
            .await
        {
            Ok(true) => Ok(true),
            Ok(false) => self.inner.jobs.fail_pending(job_id, message).await,
            Err(err) => Err(err),
        };
        match recorded {
            Ok(true) => warn!(job_id, error = %failure, "Abandoned job marked failed"),
            Ok(false) => {}
            Err(err) => error!(job_id, error = %err, "Could not fail abandoned job"),
        }
    }

    async fn execute(&self, job: &JobModel, token: &CancellationToken) -> IngestResult<()> {
        let inner = &self.inner;
        let adapter = inner.adapters.get(&job.source)?;
        let config = parse_config(&job.config)?;
        let ctx = FetchContext::new(inner.fetch.clone(), job.source.as_str(), job.id, token.clone());
        let deadline = Instant::now() + Duration::from_secs(inner.config.max_run_seconds);

        let descriptors = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(cancelled()),
            _ = sleep_until(deadline) => {
                return Err(IngestError::TimedOut {
                    seconds: inner.config.max_run_seconds,
                });
            }
            described = adapter.describe(&config, &ctx) => described?,
        };

        let mut handles: HashMap<TableKey, TableHandle> = HashMap::new();
        for descriptor in &descriptors {
            if token.is_cancelled() {
                return Err(cancelled());
            }
            if descriptor.table_key.source() != job.source {
                return Err(IngestError::invalid_descriptor(
                    descriptor.table_key.to_string(),
                    format!("table key is not owned by source '{}'", job.source),
                ));
            }
            if handles.contains_key(&descriptor.table_key) {
                return Err(IngestError::invalid_descriptor(
                    descriptor.table_key.to_string(),
                    "table key declared more than once",
                ));
            }
            let handle = inner.materializer.materialize(descriptor).await?;
            handles.insert(descriptor.table_key.clone(), handle);
        }

        let (tx, mut rx) = mpsc::channel(inner.config.batch_queue_depth.max(1));
        let emitter = BatchEmitter::new(handles.keys().cloned().collect(), tx);
        let mut producer = adapter.fetch(&config, &ctx, emitter);

        let consumer = self.write_batches(job.id, &mut rx, &handles, token, deadline);
        tokio::pin!(consumer);

        // Drive both sides until the writer is done; a fetch that ends first
        // closes the queue and lets the writer drain what was already emitted.
        let mut fetch_result = None;
        let written = loop {
            tokio::select! {
                result = &mut consumer => break result,
                result = &mut producer, if fetch_result.is_none() => fetch_result = Some(result),
            }
        };

        let touched = written?;
        match fetch_result {
            Some(result) => result?,
            None => producer.await?,
        }

        let touched: Vec<TableKey> = touched.into_iter().collect();
        inner.registry.touch_refreshed(&touched).await?;
        Ok(())
    }

    /// Apply queued batches in emission order until the queue closes, checking
    /// for cancellation and the deadline before each one. Returns the tables
    /// that received data.
    async fn write_batches(
        &self,
        job_id: i32,
        rx: &mut mpsc::Receiver<EmittedBatch>,
        handles: &HashMap<TableKey, TableHandle>,
        token: &CancellationToken,
        deadline: Instant,
    ) -> IngestResult<HashSet<TableKey>> {
        let counter = JobRowCounter { job_id };
        let mut touched = HashSet::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(cancelled()),
                _ = sleep_until(deadline) => {
                    return Err(IngestError::TimedOut {
                        seconds: self.inner.config.max_run_seconds,
                    });
                }
                next = rx.recv() => next,
            };
            let Some(EmittedBatch { table_key, batch }) = next else {
                return Ok(touched);
            };

            let handle = handles
                .get(&table_key)
                .ok_or_else(|| IngestError::UndeclaredTable {
                    table_key: table_key.to_string(),
                })?;
            let written = self
                .inner
                .upsert
                .write_with_sink(handle, batch, &handle.conflict_key, Some(&counter))
                .await?;
            debug!(table_key = %table_key, written, "Batch committed");
            touched.insert(table_key);
        }
    }

    /// Spawn the oldest pending jobs, up to the number of idle workers.
    pub async fn dispatch_pending(&self) -> IngestResult<Vec<JobHandle>> {
        let free = self.inner.workers.available_permits();
        if free == 0 {
            return Ok(Vec::new());
        }

        let mut handles = Vec::new();
        for job_id in self.inner.jobs.pending_ids(free as u64).await? {
            match self.spawn(job_id) {
                Ok(handle) => handles.push(handle),
                // Already queued by an earlier tick.
                Err(IngestError::InvalidState { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(handles)
    }

    /// Poll for pending jobs until `shutdown` fires, then wait for in-flight
    /// runs to finish.
    pub async fn run_dispatcher(&self, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.inner.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            workers = self.inner.config.worker_concurrency,
            poll_interval_ms = self.inner.config.poll_interval_ms,
            "Job dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.dispatch_pending().await {
                    Ok(handles) if !handles.is_empty() => {
                        info!(dispatched = handles.len(), "Dispatched pending jobs");
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "Failed to dispatch pending jobs"),
                },
            }
        }

        info!(in_flight = self.running_jobs().len(), "Dispatcher stopping; waiting for running jobs");
        let all = u32::try_from(self.inner.config.worker_concurrency.max(1)).unwrap_or(u32::MAX);
        let _drained = self.inner.workers.acquire_many(all).await;
        info!("Job dispatcher stopped");
    }
}

fn invalid_state(job: &JobModel, action: &str) -> IngestError {
    IngestError::InvalidState {
        job_id: job.id,
        status: job.status.clone(),
        action: action.to_string(),
    }
}

/// "panicked: <message>" or "aborted: <reason>" for a task that did not return.
fn task_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("aborted: {err}");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("panicked: {message}")
}

/// The stored config must be a JSON object; adapters own everything inside it.
fn parse_config(value: &JsonValue) -> IngestResult<JobConfig> {
    match value {
        JsonValue::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => Err(IngestError::invalid_config(format!(
            "config must be a JSON object, got {}",
            json_type(other)
        ))),
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
