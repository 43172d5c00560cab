//! Repository tests for job transitions and the dataset registry.

mod test_utils;

use ingestor::models::JobStatus;
use ingestor::repositories::{DatasetRegistry, JobRepository, RegistryEntry};
use ingestor::schema::{FieldSpec, SemanticType, TableKey};
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde_json::json;
use test_utils::setup_test_db;

async fn repo() -> (DatabaseConnection, JobRepository) {
    let db = setup_test_db().await.unwrap();
    (db.clone(), JobRepository::new(db))
}

#[tokio::test]
async fn test_transitions_only_move_forward() {
    let (_db, jobs) = repo().await;
    let job = jobs.create("fred", json!({"series": ["DFF"]})).await.unwrap();
    assert_eq!(job.job_status(), JobStatus::Pending);

    // Cannot finish a job that never started.
    assert!(!jobs.finish(job.id, JobStatus::Success, None).await.unwrap());

    assert!(jobs.mark_running(job.id).await.unwrap());
    assert!(!jobs.mark_running(job.id).await.unwrap());
    assert!(!jobs.fail_pending(job.id, "too late".into()).await.unwrap());

    assert!(
        jobs.finish(job.id, JobStatus::Failed, Some("adapter_error: boom".into()))
            .await
            .unwrap()
    );
    assert!(!jobs.finish(job.id, JobStatus::Success, None).await.unwrap());

    let stored = jobs.find(job.id).await.unwrap().unwrap();
    assert_eq!(stored.job_status(), JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("adapter_error: boom"));
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_row_counter_only_moves_while_running() {
    let (db, jobs) = repo().await;
    let job = jobs.create("fred", json!({})).await.unwrap();

    JobRepository::increment_rows(&db, job.id, 10).await.unwrap();
    assert_eq!(jobs.find(job.id).await.unwrap().unwrap().rows_inserted, 0);

    jobs.mark_running(job.id).await.unwrap();
    let txn = db.begin().await.unwrap();
    JobRepository::increment_rows(&txn, job.id, 10).await.unwrap();
    JobRepository::increment_rows(&txn, job.id, 5).await.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(jobs.find(job.id).await.unwrap().unwrap().rows_inserted, 15);

    // Rolled back with its chunk.
    let txn = db.begin().await.unwrap();
    JobRepository::increment_rows(&txn, job.id, 100).await.unwrap();
    txn.rollback().await.unwrap();
    assert_eq!(jobs.find(job.id).await.unwrap().unwrap().rows_inserted, 15);

    jobs.finish(job.id, JobStatus::Success, None).await.unwrap();
    JobRepository::increment_rows(&db, job.id, 7).await.unwrap();
    assert_eq!(jobs.find(job.id).await.unwrap().unwrap().rows_inserted, 15);
}

#[tokio::test]
async fn test_pending_ids_are_oldest_first() {
    let (_db, jobs) = repo().await;
    let a = jobs.create("fred", json!({})).await.unwrap();
    let b = jobs.create("bls", json!({})).await.unwrap();
    let c = jobs.create("fred", json!({})).await.unwrap();
    jobs.mark_running(b.id).await.unwrap();

    assert_eq!(jobs.pending_ids(10).await.unwrap(), vec![a.id, c.id]);
    assert_eq!(jobs.pending_ids(1).await.unwrap(), vec![a.id]);
}

#[tokio::test]
async fn test_registry_round_trip_and_refresh() {
    let db = setup_test_db().await.unwrap();
    let registry = DatasetRegistry::new(db);
    let key = TableKey::new("census", "population");

    let entry = RegistryEntry {
        table_key: key.clone(),
        physical_name: "ds_census_population".into(),
        schema_version: 1,
        fields: vec![
            FieldSpec::required("geo_id", SemanticType::Text),
            FieldSpec::optional("population", SemanticType::Integer),
        ],
        conflict_key: vec!["geo_id".into()],
        last_refreshed_at: None,
    };
    registry.upsert_entry(&entry).await.unwrap();
    assert_eq!(registry.lookup(&key).await.unwrap().unwrap(), entry);

    let bumped = RegistryEntry {
        schema_version: 2,
        ..entry.clone()
    };
    registry.upsert_entry(&bumped).await.unwrap();

    registry.touch_refreshed(&[key.clone()]).await.unwrap();
    let stored = registry.lookup(&key).await.unwrap().unwrap();
    assert_eq!(stored.schema_version, 2);
    assert!(stored.last_refreshed_at.is_some());

    assert_eq!(registry.list_for_source("census").await.unwrap().len(), 1);
    assert!(registry.list_for_source("fred").await.unwrap().is_empty());
}
