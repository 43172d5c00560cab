//! Adapter trait definition
//!
//! Defines the capability set every source adapter provides, plus the handles
//! the core passes into an adapter while a job runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, IngestResult};
use crate::fetch::{FetchClient, FetchRequest, FetchResponse};
use crate::schema::{DatasetDescriptor, RecordBatch, TableKey};

/// Opaque adapter-defined job configuration. The core only persists it.
pub type JobConfig = BTreeMap<String, JsonValue>;

/// A batch in flight from an adapter to the writer.
#[derive(Debug)]
pub struct EmittedBatch {
    pub table_key: TableKey,
    pub batch: RecordBatch,
}

/// Per-run handle for outbound requests.
#[derive(Clone)]
pub struct FetchContext {
    pub client: FetchClient,
    pub source: String,
    pub job_id: i32,
    pub cancel: CancellationToken,
}

impl FetchContext {
    pub fn new<S: Into<String>>(
        client: FetchClient,
        source: S,
        job_id: i32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            source: source.into(),
            job_id,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fetch through the shared client; refuses to start once the job is cancelled.
    pub async fn fetch(&self, request: &FetchRequest) -> IngestResult<FetchResponse> {
        if self.is_cancelled() {
            return Err(IngestError::Cancelled {
                reason: "cancellation requested".to_string(),
            });
        }
        self.client.fetch(request).await
    }
}

/// Sending half of the bounded queue between an adapter and the writer.
#[derive(Clone)]
pub struct BatchEmitter {
    declared: Arc<HashSet<TableKey>>,
    tx: mpsc::Sender<EmittedBatch>,
}

impl BatchEmitter {
    pub fn new(declared: HashSet<TableKey>, tx: mpsc::Sender<EmittedBatch>) -> Self {
        Self {
            declared: Arc::new(declared),
            tx,
        }
    }

    /// Hand `batch` to the writer, waiting while the queue is full.
    pub async fn emit(&self, table_key: &TableKey, batch: RecordBatch) -> IngestResult<()> {
        if !self.declared.contains(table_key) {
            return Err(IngestError::UndeclaredTable {
                table_key: table_key.to_string(),
            });
        }
        self.tx
            .send(EmittedBatch {
                table_key: table_key.clone(),
                batch,
            })
            .await
            .map_err(|_| IngestError::Cancelled {
                reason: "batch writer stopped".to_string(),
            })
    }
}

/// Source adapter capability set.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Check the config shape. Synchronous and free of I/O.
    fn validate(&self, config: &JobConfig) -> IngestResult<()>;

    /// Declare every table this run will write to, before any data is fetched.
    async fn describe(
        &self,
        config: &JobConfig,
        ctx: &FetchContext,
    ) -> IngestResult<Vec<DatasetDescriptor>>;

    /// Fetch data and emit batches; returning `Ok` means no more data.
    async fn fetch(
        &self,
        config: &JobConfig,
        ctx: &FetchContext,
        emit: BatchEmitter,
    ) -> IngestResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_rejects_undeclared_tables() {
        let (tx, mut rx) = mpsc::channel(1);
        let declared = TableKey::new("fred", "rates");
        let emitter = BatchEmitter::new(HashSet::from([declared.clone()]), tx);

        let err = emitter
            .emit(&TableKey::new("fred", "other"), RecordBatch::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "undeclared_table");

        emitter.emit(&declared, RecordBatch::new()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().table_key, declared);
    }

    #[tokio::test]
    async fn test_emit_fails_once_writer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        let declared = TableKey::new("fred", "rates");
        let emitter = BatchEmitter::new(HashSet::from([declared.clone()]), tx);
        drop(rx);

        let err = emitter.emit(&declared, RecordBatch::new()).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
