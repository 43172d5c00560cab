//! Migration to create the dataset_registry table.
//!
//! Catalog row per materialized table key: physical table name, schema version,
//! the recorded field list and conflict key, and the last refresh time.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DatasetRegistry::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DatasetRegistry::TableKey)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DatasetRegistry::PhysicalName)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(DatasetRegistry::Source).text().not_null())
                    .col(
                        ColumnDef::new(DatasetRegistry::SchemaVersion)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(DatasetRegistry::Fields)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DatasetRegistry::ConflictKey)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DatasetRegistry::LastRefreshedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DatasetRegistry::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DatasetRegistry::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dataset_registry_source")
                    .table(DatasetRegistry::Table)
                    .col(DatasetRegistry::Source)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_dataset_registry_source").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(DatasetRegistry::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DatasetRegistry {
    Table,
    TableKey,
    PhysicalName,
    Source,
    SchemaVersion,
    Fields,
    ConflictKey,
    LastRefreshedAt,
    CreatedAt,
    UpdatedAt,
}
