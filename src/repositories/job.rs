//! # Job Repository
//!
//! Persistence for job records. Every status change is a conditional update on
//! the expected current status, so concurrent callers can never move a job
//! backwards or finish it twice.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::error::IngestResult;
use crate::models::job::{ActiveModel, Column, Entity, JobStatus, Model};

/// Default page size for [`JobRepository::list`].
pub const DEFAULT_LIST_LIMIT: u64 = 50;
/// Upper bound on the page size for [`JobRepository::list`].
pub const MAX_LIST_LIMIT: u64 = 500;

/// Filters for job listing.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub source: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl JobFilter {
    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn effective_limit(&self) -> u64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

/// Repository for job database operations
#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a new pending job.
    pub async fn create(&self, source: &str, config: JsonValue) -> IngestResult<Model> {
        let now = Utc::now().fixed_offset();
        let job = ActiveModel {
            source: Set(source.to_string()),
            config: Set(config),
            status: Set(JobStatus::Pending.as_str().to_string()),
            rows_inserted: Set(0),
            error_message: Set(None),
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            updated_at: Set(now),
            ..Default::default()
        };

        let created = job.insert(&self.db).await?;
        info!(job_id = created.id, source = %created.source, "Job created");
        Ok(created)
    }

    pub async fn find(&self, job_id: i32) -> IngestResult<Option<Model>> {
        Ok(Entity::find_by_id(job_id).one(&self.db).await?)
    }

    /// Jobs matching `filter`, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> IngestResult<Vec<Model>> {
        let mut query = Entity::find().order_by_asc(Column::Id);

        if let Some(source) = &filter.source {
            query = query.filter(Column::Source.eq(source.as_str()));
        }

        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }

        Ok(query
            .offset(filter.offset.unwrap_or(0))
            .limit(filter.effective_limit())
            .all(&self.db)
            .await?)
    }

    /// Ids of the oldest pending jobs.
    pub async fn pending_ids(&self, limit: u64) -> IngestResult<Vec<i32>> {
        Ok(Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(JobStatus::Pending.as_str()))
            .order_by_asc(Column::Id)
            .limit(limit)
            .into_tuple::<i32>()
            .all(&self.db)
            .await?)
    }

    /// `pending -> running`. Returns false if the job was not pending.
    pub async fn mark_running(&self, job_id: i32) -> IngestResult<bool> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `running -> success|failed`, freezing the counter and recording the
    /// failure text. Returns false if the job was not running.
    pub async fn finish(
        &self,
        job_id: i32,
        status: JobStatus,
        error_message: Option<String>,
    ) -> IngestResult<bool> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(Column::ErrorMessage, Expr::value(error_message))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `pending -> failed` without ever starting. Returns false if the job was
    /// not pending.
    pub async fn fail_pending(&self, job_id: i32, error_message: String) -> IngestResult<bool> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(Column::ErrorMessage, Expr::value(Some(error_message)))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Add `delta` to a running job's counter on `conn`, typically the
    /// transaction that committed those rows.
    pub async fn increment_rows<C: ConnectionTrait>(
        conn: &C,
        job_id: i32,
        delta: u64,
    ) -> Result<(), DbErr> {
        let delta = i64::try_from(delta).unwrap_or(i64::MAX);
        Entity::update_many()
            .col_expr(
                Column::RowsInserted,
                Expr::col(Column::RowsInserted).add(delta),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(conn)
            .await?;
        Ok(())
    }
}
