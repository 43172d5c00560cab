//! Dataset registry entity model
//!
//! Catalog row per materialized table key. `fields` and `conflict_key` hold the
//! recorded schema so later descriptors can be diffed against it.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dataset_registry")]
pub struct Model {
    /// "<source>.<dataset>" identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub table_key: String,

    /// Sanitized physical table name
    pub physical_name: String,

    pub source: String,

    /// Starts at 1, incremented on each additive change
    pub schema_version: i32,

    /// Serialized `Vec<FieldSpec>` in declaration order
    #[sea_orm(column_type = "JsonBinary")]
    pub fields: JsonValue,

    /// Serialized `Vec<String>` of conflict key field names
    #[sea_orm(column_type = "JsonBinary")]
    pub conflict_key: JsonValue,

    pub last_refreshed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
