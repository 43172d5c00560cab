//! Schema materializer and upsert engine integration tests against SQLite.

mod test_utils;

use ingestor::config::UpsertConfig;
use ingestor::materializer::SchemaMaterializer;
use ingestor::repositories::DatasetRegistry;
use ingestor::schema::{
    DatasetDescriptor, FieldSpec, FieldValue, RecordBatch, SemanticType, TableKey, record,
};
use ingestor::upsert::UpsertEngine;
use test_utils::*;

const RATES_TABLE: &str = "ds_fred_interest_rates";

#[tokio::test]
async fn test_materialize_creates_table_and_registry_entry() {
    let db = setup_test_db().await.unwrap();
    let materializer = SchemaMaterializer::new(db.clone());

    let handle = materializer.materialize(&rates_descriptor()).await.unwrap();
    assert_eq!(handle.physical_name, RATES_TABLE);
    assert_eq!(handle.schema_version, 1);
    assert_eq!(
        table_columns(&db, RATES_TABLE).await.unwrap(),
        vec!["series_id", "date", "value"]
    );

    let entry = DatasetRegistry::new(db.clone())
        .lookup(&rates_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.physical_name, RATES_TABLE);
    assert_eq!(entry.conflict_key, vec!["series_id", "date"]);
    assert!(entry.last_refreshed_at.is_none());

    // Same descriptor again is a no-op.
    let again = materializer.materialize(&rates_descriptor()).await.unwrap();
    assert_eq!(again, handle);
}

#[tokio::test]
async fn test_additive_change_preserves_rows() {
    let db = setup_test_db().await.unwrap();
    let materializer = SchemaMaterializer::new(db.clone());
    let engine = UpsertEngine::new(db.clone(), &UpsertConfig::default());

    let handle = materializer.materialize(&rates_descriptor()).await.unwrap();
    engine
        .write(&handle, daily_rates("DFF", 3, 1.0), &handle.conflict_key)
        .await
        .unwrap();

    let extended = rates_descriptor().field(FieldSpec::optional("realtime_start", SemanticType::Date));
    let handle = materializer.materialize(&extended).await.unwrap();
    assert_eq!(handle.schema_version, 2);
    assert_eq!(
        table_columns(&db, RATES_TABLE).await.unwrap(),
        vec!["series_id", "date", "value", "realtime_start"]
    );
    assert_eq!(count_rows(&db, RATES_TABLE).await.unwrap(), 3);

    // Old rows read the new column as null; new rows can fill it.
    let mut row = rate("DFF", day(4), 2.0);
    row.insert("realtime_start".into(), FieldValue::Date(day(4)));
    engine
        .write(&handle, RecordBatch::from(vec![row]), &handle.conflict_key)
        .await
        .unwrap();
    assert_eq!(count_rows(&db, RATES_TABLE).await.unwrap(), 4);

    let entry = DatasetRegistry::new(db.clone())
        .lookup(&rates_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.schema_version, 2);
    assert_eq!(entry.fields.len(), 4);
}

#[tokio::test]
async fn test_conflicting_change_leaves_table_untouched() {
    let db = setup_test_db().await.unwrap();
    let materializer = SchemaMaterializer::new(db.clone());
    let engine = UpsertEngine::new(db.clone(), &UpsertConfig::default());

    let handle = materializer.materialize(&rates_descriptor()).await.unwrap();
    engine
        .write(&handle, daily_rates("DFF", 2, 1.0), &handle.conflict_key)
        .await
        .unwrap();

    let retyped = DatasetDescriptor::new(rates_key())
        .field(FieldSpec::required("series_id", SemanticType::Text))
        .field(FieldSpec::required("date", SemanticType::Date))
        .field(FieldSpec::optional("value", SemanticType::Text))
        .field(FieldSpec::optional("units", SemanticType::Text))
        .with_conflict_key(["series_id", "date"]);
    let err = materializer.materialize(&retyped).await.unwrap_err();
    assert_eq!(err.kind(), "schema_conflict");

    assert_eq!(
        table_columns(&db, RATES_TABLE).await.unwrap(),
        vec!["series_id", "date", "value"]
    );
    assert_eq!(count_rows(&db, RATES_TABLE).await.unwrap(), 2);
    let entry = DatasetRegistry::new(db.clone())
        .lookup(&rates_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.schema_version, 1);
}

#[tokio::test]
async fn test_concurrent_materialize_creates_once() {
    let db = setup_test_db().await.unwrap();
    let materializer = SchemaMaterializer::new(db.clone());

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let materializer = materializer.clone();
            tokio::spawn(async move { materializer.materialize(&rates_descriptor()).await })
        })
        .collect();

    for task in tasks {
        let handle = task.await.unwrap().unwrap();
        assert_eq!(handle.schema_version, 1);
        assert_eq!(handle.physical_name, RATES_TABLE);
    }

    let entries = DatasetRegistry::new(db.clone())
        .list_for_source("fred")
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_invalid_descriptor_is_rejected_before_ddl() {
    let db = setup_test_db().await.unwrap();
    let materializer = SchemaMaterializer::new(db.clone());

    let nullable_key = DatasetDescriptor::new(TableKey::new("fred", "broken"))
        .field(FieldSpec::optional("series_id", SemanticType::Text))
        .with_conflict_key(["series_id"]);
    let err = materializer.materialize(&nullable_key).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_descriptor");

    let registry = DatasetRegistry::new(db.clone());
    assert!(registry.lookup(&TableKey::new("fred", "broken")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_upsert_inserts_then_updates() {
    let db = setup_test_db().await.unwrap();
    let handle = SchemaMaterializer::new(db.clone())
        .materialize(&rates_descriptor())
        .await
        .unwrap();
    let engine = UpsertEngine::new(db.clone(), &UpsertConfig::default());

    let written = engine
        .write(&handle, daily_rates("DFF", 2, 1.0), &handle.conflict_key)
        .await
        .unwrap();
    assert_eq!(written, 2);

    let written = engine
        .write(
            &handle,
            RecordBatch::from(vec![rate("DFF", day(2), 9.5)]),
            &handle.conflict_key,
        )
        .await
        .unwrap();
    assert_eq!(written, 1);

    let rows = rate_rows(&db, RATES_TABLE).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].2, Some(1.0));
    assert_eq!(rows[1].2, Some(9.5));
}

#[tokio::test]
async fn test_upsert_chunks_large_batches_and_dedupes() {
    let db = setup_test_db().await.unwrap();
    let handle = SchemaMaterializer::new(db.clone())
        .materialize(&rates_descriptor())
        .await
        .unwrap();
    let engine = UpsertEngine::new(
        db.clone(),
        &UpsertConfig {
            chunk_size: 7,
            ..UpsertConfig::default()
        },
    );

    let mut batch = daily_rates("DFF", 100, 1.0);
    // Repeats the first key; the later value wins.
    batch.push(rate("DFF", day(1), 42.0));
    let written = engine
        .write(&handle, batch, &handle.conflict_key)
        .await
        .unwrap();

    assert_eq!(written, 100);
    assert_eq!(count_rows(&db, RATES_TABLE).await.unwrap(), 100);
    let rows = rate_rows(&db, RATES_TABLE).await.unwrap();
    assert_eq!(rows[0].2, Some(42.0));
}

#[tokio::test]
async fn test_upsert_null_values_and_empty_batch() {
    let db = setup_test_db().await.unwrap();
    let handle = SchemaMaterializer::new(db.clone())
        .materialize(&rates_descriptor())
        .await
        .unwrap();
    let engine = UpsertEngine::new(db.clone(), &UpsertConfig::default());

    let empty = engine
        .write(&handle, RecordBatch::new(), &handle.conflict_key)
        .await
        .unwrap();
    assert_eq!(empty, 0);

    let missing_value = record([
        ("series_id", FieldValue::from("DFF")),
        ("date", FieldValue::Date(day(1))),
    ]);
    engine
        .write(
            &handle,
            RecordBatch::from(vec![missing_value]),
            &handle.conflict_key,
        )
        .await
        .unwrap();
    let rows = rate_rows(&db, RATES_TABLE).await.unwrap();
    assert_eq!(rows, vec![("DFF".to_string(), day(1), None)]);
}

#[tokio::test]
async fn test_upsert_rejects_mismatched_conflict_key() {
    let db = setup_test_db().await.unwrap();
    let handle = SchemaMaterializer::new(db.clone())
        .materialize(&rates_descriptor())
        .await
        .unwrap();
    let engine = UpsertEngine::new(db.clone(), &UpsertConfig::default());

    let err = engine
        .write(&handle, daily_rates("DFF", 1, 1.0), &["series_id".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_descriptor");
    assert_eq!(count_rows(&db, RATES_TABLE).await.unwrap(), 0);
}
