//! Database migrations for the ingestion core.
//!
//! Only the core-owned tables live here. Adapter tables are created at runtime
//! by the schema materializer.

pub use sea_orm_migration::prelude::*;

mod m2025_01_06_090000_create_jobs;
mod m2025_01_06_090100_create_dataset_registry;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_06_090000_create_jobs::Migration),
            Box::new(m2025_01_06_090100_create_dataset_registry::Migration),
        ]
    }
}
