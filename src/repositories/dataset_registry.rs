//! # Dataset Registry
//!
//! One catalog row per materialized table key. Pure bookkeeping: the schema
//! materializer decides what to do with what it finds here.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use crate::error::{IngestError, IngestResult};
use crate::models::dataset_registry::{ActiveModel, Column, Entity, Model};
use crate::schema::{FieldSpec, TableKey};

/// Typed view of a registry row.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub table_key: TableKey,
    pub physical_name: String,
    pub schema_version: i32,
    pub fields: Vec<FieldSpec>,
    pub conflict_key: Vec<String>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl TryFrom<Model> for RegistryEntry {
    type Error = IngestError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: serde_json::Error| {
            IngestError::storage(format!(
                "registry entry {} has unreadable {what}: {e}",
                model.table_key
            ))
        };
        let fields =
            serde_json::from_value(model.fields.clone()).map_err(|e| corrupt("fields", e))?;
        let conflict_key = serde_json::from_value(model.conflict_key.clone())
            .map_err(|e| corrupt("conflict key", e))?;

        Ok(Self {
            table_key: model.table_key.parse()?,
            physical_name: model.physical_name,
            schema_version: model.schema_version,
            fields,
            conflict_key,
            last_refreshed_at: model.last_refreshed_at.map(|t| t.with_timezone(&Utc)),
        })
    }
}

#[derive(Clone)]
pub struct DatasetRegistry {
    db: DatabaseConnection,
}

impl DatasetRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn lookup(&self, table_key: &TableKey) -> IngestResult<Option<RegistryEntry>> {
        Self::lookup_with(&self.db, table_key).await
    }

    /// Entry for `table_key` read through `conn` (a transaction or the pool).
    pub async fn lookup_with<C: ConnectionTrait>(
        conn: &C,
        table_key: &TableKey,
    ) -> IngestResult<Option<RegistryEntry>> {
        Entity::find_by_id(table_key.to_string())
            .one(conn)
            .await?
            .map(RegistryEntry::try_from)
            .transpose()
    }

    /// Table key already owning `physical_name`, if any.
    pub async fn owner_of_physical_name<C: ConnectionTrait>(
        conn: &C,
        physical_name: &str,
    ) -> IngestResult<Option<String>> {
        Ok(Entity::find()
            .filter(Column::PhysicalName.eq(physical_name))
            .one(conn)
            .await?
            .map(|m| m.table_key))
    }

    pub async fn upsert_entry(&self, entry: &RegistryEntry) -> IngestResult<()> {
        Self::upsert_entry_with(&self.db, entry).await
    }

    /// Insert or replace the recorded schema for `entry.table_key`.
    /// `created_at` and `last_refreshed_at` of an existing row are kept.
    pub async fn upsert_entry_with<C: ConnectionTrait>(
        conn: &C,
        entry: &RegistryEntry,
    ) -> IngestResult<()> {
        let now = Utc::now().fixed_offset();
        let fields = serde_json::to_value(&entry.fields)
            .map_err(|e| IngestError::storage(format!("failed to encode fields: {e}")))?;
        let conflict_key = serde_json::to_value(&entry.conflict_key)
            .map_err(|e| IngestError::storage(format!("failed to encode conflict key: {e}")))?;

        let row = ActiveModel {
            table_key: Set(entry.table_key.to_string()),
            physical_name: Set(entry.physical_name.clone()),
            source: Set(entry.table_key.source().to_string()),
            schema_version: Set(entry.schema_version),
            fields: Set(fields),
            conflict_key: Set(conflict_key),
            last_refreshed_at: Set(entry.last_refreshed_at.map(|t| t.fixed_offset())),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Entity::insert(row)
            .on_conflict(
                OnConflict::column(Column::TableKey)
                    .update_columns([
                        Column::PhysicalName,
                        Column::SchemaVersion,
                        Column::Fields,
                        Column::ConflictKey,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Stamp `last_refreshed_at` on every given table key.
    pub async fn touch_refreshed(&self, table_keys: &[TableKey]) -> IngestResult<()> {
        if table_keys.is_empty() {
            return Ok(());
        }
        let now = Utc::now().fixed_offset();
        Entity::update_many()
            .col_expr(Column::LastRefreshedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::TableKey.is_in(table_keys.iter().map(|k| k.to_string())))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Every entry recorded for `source`.
    pub async fn list_for_source(&self, source: &str) -> IngestResult<Vec<RegistryEntry>> {
        Entity::find()
            .filter(Column::Source.eq(source))
            .all(&self.db)
            .await?
            .into_iter()
            .map(RegistryEntry::try_from)
            .collect()
    }
}
