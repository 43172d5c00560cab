//! # Upsert Engine
//!
//! Writes record batches with "insert, or update every non-key column on
//! conflict" semantics. Batches are split into chunks that each commit in
//! their own transaction; every value is a bound parameter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use sea_orm::sea_query::{Alias, OnConflict, Query, SimpleExpr};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait,
};
use tracing::{debug, instrument, warn};

use crate::config::UpsertConfig;
use crate::error::{IngestError, IngestResult, is_connection_error};
use crate::materializer::TableHandle;
use crate::repositories::JobRepository;
use crate::schema::{FieldValue, Record, RecordBatch};

/// Keeps a single statement under the bind-parameter limits of both backends.
const MAX_BIND_PARAMS: usize = 30_000;

const STORAGE_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Hook run inside each chunk's transaction after the rows are written.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn chunk_written(&self, txn: &DatabaseTransaction, rows: u64) -> Result<(), DbErr>;
}

/// Bumps a job's `rows_inserted` in the same transaction as the rows.
pub struct JobRowCounter {
    pub job_id: i32,
}

#[async_trait]
impl ChunkSink for JobRowCounter {
    async fn chunk_written(&self, txn: &DatabaseTransaction, rows: u64) -> Result<(), DbErr> {
        JobRepository::increment_rows(txn, self.job_id, rows).await
    }
}

#[derive(Clone)]
pub struct UpsertEngine {
    db: DatabaseConnection,
    chunk_size: usize,
    storage_retries: u32,
}

impl UpsertEngine {
    pub fn new(db: DatabaseConnection, config: &UpsertConfig) -> Self {
        Self {
            db,
            chunk_size: config.chunk_size.max(1),
            storage_retries: config.storage_retries,
        }
    }

    /// Upsert `batch` into `handle`'s table and return rows inserted plus updated.
    pub async fn write(
        &self,
        handle: &TableHandle,
        batch: RecordBatch,
        conflict_key: &[String],
    ) -> IngestResult<u64> {
        self.write_with_sink(handle, batch, conflict_key, None).await
    }

    /// Like [`UpsertEngine::write`], running `sink` inside every chunk transaction.
    #[instrument(skip_all, fields(table = %handle.physical_name, rows = batch.len()))]
    pub async fn write_with_sink(
        &self,
        handle: &TableHandle,
        batch: RecordBatch,
        conflict_key: &[String],
        sink: Option<&dyn ChunkSink>,
    ) -> IngestResult<u64> {
        if conflict_key != handle.conflict_key.as_slice() {
            return Err(IngestError::invalid_descriptor(
                handle.table_key.to_string(),
                format!(
                    "conflict key {:?} does not match the table's {:?}",
                    conflict_key, handle.conflict_key
                ),
            ));
        }

        for record in batch.records() {
            check_record(handle, record)?;
        }

        let rows = dedupe_by_key(handle, batch.into_records());
        if rows.is_empty() {
            return Ok(0);
        }

        let per_chunk = self
            .chunk_size
            .min(MAX_BIND_PARAMS / handle.fields.len().max(1))
            .max(1);

        let mut total = 0;
        for chunk in rows.chunks(per_chunk) {
            total += self.write_chunk(handle, chunk, sink).await?;
        }

        counter!("upsert_rows_total", "table" => handle.physical_name.clone()).increment(total);
        debug!(affected = total, "Batch upserted");
        Ok(total)
    }

    async fn write_chunk(
        &self,
        handle: &TableHandle,
        rows: &[Record],
        sink: Option<&dyn ChunkSink>,
    ) -> IngestResult<u64> {
        let mut attempt = 0;
        let mut delay = STORAGE_RETRY_BASE_DELAY;
        loop {
            match self.try_write_chunk(handle, rows, sink).await {
                Ok(affected) => return Ok(affected),
                Err(err) if is_connection_error(&err) && attempt < self.storage_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Chunk write hit a connection error; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    return Err(IngestError::storage(format!(
                        "writing {} rows to {} failed: {err}",
                        rows.len(),
                        handle.physical_name
                    )));
                }
            }
        }
    }

    async fn try_write_chunk(
        &self,
        handle: &TableHandle,
        rows: &[Record],
        sink: Option<&dyn ChunkSink>,
    ) -> Result<u64, DbErr> {
        let columns: Vec<Alias> = handle
            .fields
            .iter()
            .map(|f| Alias::new(f.column()))
            .collect();

        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(&handle.physical_name))
            .columns(columns);

        for row in rows {
            let values: Vec<SimpleExpr> = handle
                .fields
                .iter()
                .map(|f| {
                    row.get(&f.name)
                        .unwrap_or(&FieldValue::Null)
                        .to_value(f.semantic_type)
                        .into()
                })
                .collect();
            insert
                .values(values)
                .map_err(|e| DbErr::Custom(e.to_string()))?;
        }

        let key_columns = handle
            .conflict_key
            .iter()
            .filter_map(|k| handle.field(k))
            .map(|f| Alias::new(f.column()));
        let update_columns: Vec<Alias> = handle
            .fields
            .iter()
            .filter(|f| !handle.is_key_field(&f.name))
            .map(|f| Alias::new(f.column()))
            .collect();

        let mut on_conflict = OnConflict::columns(key_columns);
        if update_columns.is_empty() {
            on_conflict.do_nothing();
        } else {
            on_conflict.update_columns(update_columns);
        }
        insert.on_conflict(on_conflict);

        let txn = self.db.begin().await?;
        let backend = txn.get_database_backend();
        let result = txn.execute(backend.build(&insert)).await?;
        let affected = result.rows_affected();
        if let Some(sink) = sink {
            sink.chunk_written(&txn, affected).await?;
        }
        txn.commit().await?;

        Ok(affected)
    }
}

/// Reject records that do not match the table's declared fields.
fn check_record(handle: &TableHandle, record: &Record) -> IngestResult<()> {
    let invalid = |reason: String| IngestError::invalid_record(handle.table_key.to_string(), reason);

    if let Some(unknown) = record.keys().find(|name| handle.field(name).is_none()) {
        return Err(invalid(format!("unknown field '{unknown}'")));
    }

    for field in &handle.fields {
        match record.get(&field.name) {
            None | Some(FieldValue::Null) if !field.nullable => {
                return Err(invalid(format!("field '{}' must not be null", field.name)));
            }
            Some(value) if !value.conforms_to(field.semantic_type) => {
                return Err(invalid(format!(
                    "field '{}' expects {} but got {}",
                    field.name,
                    field.semantic_type,
                    value.type_name()
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Conflict-key component as the database will compare it: the bound value
/// for the column's type, so `Integer(1)` and `Decimal(1.0)` in a decimal
/// column collide, as do `0.0` and `-0.0`.
fn key_part(handle: &TableHandle, name: &str, value: Option<&FieldValue>) -> String {
    let value = match value {
        Some(FieldValue::Decimal(v)) => FieldValue::Decimal(v + 0.0),
        Some(other) => other.clone(),
        None => FieldValue::Null,
    };
    match handle.field(name) {
        Some(field) => format!("{:?}", value.to_value(field.semantic_type)),
        None => format!("{value:?}"),
    }
}

/// Collapse records sharing a conflict key, keeping the last one seen.
fn dedupe_by_key(handle: &TableHandle, records: Vec<Record>) -> Vec<Record> {
    let mut positions: HashMap<Vec<String>, usize> = HashMap::with_capacity(records.len());
    let mut rows: Vec<Record> = Vec::with_capacity(records.len());

    for record in records {
        let key: Vec<String> = handle
            .conflict_key
            .iter()
            .map(|k| key_part(handle, k, record.get(k)))
            .collect();
        match positions.get(&key) {
            Some(&index) => rows[index] = record,
            None => {
                positions.insert(key, rows.len());
                rows.push(record);
            }
        }
    }

    rows
}
