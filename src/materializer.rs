//! # Schema Materializer
//!
//! Turns a [`DatasetDescriptor`] into a physical table. The first call for a
//! table key creates the table plus a unique index over the conflict key;
//! later calls may only append nullable columns. Anything else is a
//! [`IngestError::SchemaConflict`] raised before any DDL runs.
//!
//! Concurrent calls for one table key are serialized by an in-process guard,
//! so racing jobs inside one worker create a table once. The guard is local to
//! the process: workers in separate processes sharing a database are not
//! coordinated. Creation uses `IF NOT EXISTS` and the registry write is an
//! upsert, so identical descriptors racing across processes converge, but two
//! different descriptors racing that way are not detected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sea_orm::sea_query::{Alias, ColumnDef, Index, Table};
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use tracing::{debug, info, instrument};

use crate::error::{IngestError, IngestResult};
use crate::repositories::{DatasetRegistry, RegistryEntry};
use crate::schema::{
    DatasetDescriptor, FieldSpec, SemanticType, TableKey, physical_table_name, sanitize_identifier,
};

/// What the upsert engine needs to write into a materialized table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHandle {
    pub table_key: TableKey,
    pub physical_name: String,
    pub fields: Vec<FieldSpec>,
    pub conflict_key: Vec<String>,
    pub schema_version: i32,
}

impl TableHandle {
    fn from_entry(entry: RegistryEntry) -> Self {
        Self {
            table_key: entry.table_key,
            physical_name: entry.physical_name,
            fields: entry.fields,
            conflict_key: entry.conflict_key,
            schema_version: entry.schema_version,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_key_field(&self, name: &str) -> bool {
        self.conflict_key.iter().any(|k| k == name)
    }
}

/// Outcome of comparing a descriptor against the recorded schema.
#[derive(Debug, Clone, PartialEq)]
enum SchemaChange {
    Unchanged,
    AddColumns(Vec<FieldSpec>),
}

#[derive(Clone)]
pub struct SchemaMaterializer {
    db: DatabaseConnection,
    guards: Arc<Mutex<HashMap<TableKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SchemaMaterializer {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ensure the table for `descriptor` exists with a compatible schema.
    #[instrument(skip(self, descriptor), fields(table_key = %descriptor.table_key))]
    pub async fn materialize(&self, descriptor: &DatasetDescriptor) -> IngestResult<TableHandle> {
        descriptor.validate()?;

        // Serialize create/alter per table key; a racing caller waits here and
        // then sees the registry entry the winner wrote.
        let guard = self.guard_for(&descriptor.table_key);
        let result = {
            let _lock = guard.lock().await;
            self.materialize_locked(descriptor).await
        };
        self.release_guard(&descriptor.table_key, guard);
        result
    }

    async fn materialize_locked(&self, descriptor: &DatasetDescriptor) -> IngestResult<TableHandle> {
        match DatasetRegistry::lookup_with(&self.db, &descriptor.table_key).await? {
            None => self.create(descriptor).await,
            Some(entry) => match diff(&entry, descriptor)? {
                SchemaChange::Unchanged => {
                    debug!(
                        schema_version = entry.schema_version,
                        "Schema unchanged; nothing to do"
                    );
                    Ok(TableHandle::from_entry(entry))
                }
                SchemaChange::AddColumns(added) => self.extend(entry, descriptor, added).await,
            },
        }
    }

    fn guard_for(&self, table_key: &TableKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self
            .guards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guards.entry(table_key.clone()).or_default().clone()
    }

    /// Drop the map's entry once no other caller holds or waits on it.
    fn release_guard(&self, table_key: &TableKey, guard: Arc<tokio::sync::Mutex<()>>) {
        let mut guards = self
            .guards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map and `guard` itself.
        if Arc::strong_count(&guard) == 2 {
            guards.remove(table_key);
        }
    }

    #[cfg(test)]
    fn guard_count(&self) -> usize {
        self.guards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    async fn create(&self, descriptor: &DatasetDescriptor) -> IngestResult<TableHandle> {
        let table_key = &descriptor.table_key;
        let physical_name = physical_table_name(table_key);

        if let Some(owner) =
            DatasetRegistry::owner_of_physical_name(&self.db, &physical_name).await?
        {
            return Err(IngestError::schema_conflict(
                table_key.to_string(),
                format!("physical table '{physical_name}' already belongs to {owner}"),
            ));
        }

        let mut table = Table::create();
        table.table(Alias::new(&physical_name)).if_not_exists();
        for field in &descriptor.fields {
            table.col(column_def(field));
        }

        let mut index = Index::create();
        index
            .name(sanitize_identifier(&format!("ux_{physical_name}")))
            .table(Alias::new(&physical_name))
            .unique()
            .if_not_exists();
        for key in &descriptor.conflict_key {
            if let Some(field) = descriptor.find_field(key) {
                index.col(Alias::new(field.column()));
            }
        }

        let entry = RegistryEntry {
            table_key: table_key.clone(),
            physical_name: physical_name.clone(),
            schema_version: 1,
            fields: descriptor.fields.clone(),
            conflict_key: descriptor.conflict_key.clone(),
            last_refreshed_at: None,
        };

        let txn = self.db.begin().await?;
        let backend = txn.get_database_backend();
        txn.execute(backend.build(&table)).await?;
        txn.execute(backend.build(&index)).await?;
        DatasetRegistry::upsert_entry_with(&txn, &entry).await?;
        txn.commit().await?;

        info!(
            physical_name = %physical_name,
            columns = descriptor.fields.len(),
            "Materialized new table"
        );
        Ok(TableHandle::from_entry(entry))
    }

    async fn extend(
        &self,
        entry: RegistryEntry,
        descriptor: &DatasetDescriptor,
        added: Vec<FieldSpec>,
    ) -> IngestResult<TableHandle> {
        let mut fields = entry.fields.clone();
        fields.extend(added.iter().cloned());

        let updated = RegistryEntry {
            schema_version: entry.schema_version + 1,
            fields,
            ..entry
        };

        let txn = self.db.begin().await?;
        let backend = txn.get_database_backend();
        // One column per statement; SQLite cannot add several at once.
        for field in &added {
            let alter = Table::alter()
                .table(Alias::new(&updated.physical_name))
                .add_column(column_def(field))
                .to_owned();
            txn.execute(backend.build(&alter)).await?;
        }
        DatasetRegistry::upsert_entry_with(&txn, &updated).await?;
        txn.commit().await?;

        info!(
            physical_name = %updated.physical_name,
            schema_version = updated.schema_version,
            added = ?added.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            table_key = %descriptor.table_key,
            "Extended table schema"
        );
        Ok(TableHandle::from_entry(updated))
    }
}

fn column_def(field: &FieldSpec) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(field.column()));
    match field.semantic_type {
        SemanticType::Integer => def.big_integer(),
        SemanticType::Decimal => def.double(),
        SemanticType::Text => def.text(),
        SemanticType::Date => def.date(),
        SemanticType::Timestamp => def.timestamp_with_time_zone(),
        SemanticType::Boolean => def.boolean(),
    };
    if field.nullable {
        def.null();
    } else {
        def.not_null();
    }
    def
}

/// Compare the requested descriptor with the recorded schema. Only appended
/// nullable fields are accepted.
fn diff(entry: &RegistryEntry, descriptor: &DatasetDescriptor) -> IngestResult<SchemaChange> {
    let key = descriptor.table_key.to_string();
    let conflict = |reason: String| IngestError::schema_conflict(key.clone(), reason);

    if entry.conflict_key != descriptor.conflict_key {
        return Err(conflict(format!(
            "conflict key changed from {:?} to {:?}",
            entry.conflict_key, descriptor.conflict_key
        )));
    }

    for recorded in &entry.fields {
        let Some(requested) = descriptor.find_field(&recorded.name) else {
            return Err(conflict(format!("field '{}' was dropped", recorded.name)));
        };
        if requested.semantic_type != recorded.semantic_type {
            return Err(conflict(format!(
                "field '{}' retyped from {} to {}",
                recorded.name, recorded.semantic_type, requested.semantic_type
            )));
        }
        if requested.nullable != recorded.nullable {
            return Err(conflict(format!(
                "nullability of field '{}' changed from {} to {}",
                recorded.name, recorded.nullable, requested.nullable
            )));
        }
    }

    let mut added = Vec::new();
    for requested in &descriptor.fields {
        if entry.fields.iter().any(|f| f.name == requested.name) {
            continue;
        }
        if !requested.nullable {
            return Err(conflict(format!(
                "new field '{}' must be nullable",
                requested.name
            )));
        }
        if entry.fields.iter().any(|f| f.column() == requested.column()) {
            return Err(conflict(format!(
                "new field '{}' collides with existing column '{}'",
                requested.name,
                requested.column()
            )));
        }
        added.push(requested.clone());
    }

    if added.is_empty() {
        Ok(SchemaChange::Unchanged)
    } else {
        Ok(SchemaChange::AddColumns(added))
    }
}
