//! Migration to create the jobs table.
//!
//! One row per ingestion attempt: the adapter source, its opaque config, the
//! lifecycle status with timestamps, the committed row counter and the bounded
//! failure description.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Jobs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Jobs::Source).text().not_null())
                    .col(ColumnDef::new(Jobs::Config).json_binary().not_null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Jobs::RowsInserted)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Listing filters on source and status
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_source_status")
                    .table(Jobs::Table)
                    .col(Jobs::Source)
                    .col(Jobs::Status)
                    .to_owned(),
            )
            .await?;

        // Dispatcher claims the oldest pending jobs
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_status_id")
                    .table(Jobs::Table)
                    .col(Jobs::Status)
                    .col(Jobs::Id)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_jobs_status_id").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_source_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    Source,
    Config,
    Status,
    RowsInserted,
    ErrorMessage,
    CreatedAt,
    StartedAt,
    CompletedAt,
    UpdatedAt,
}
