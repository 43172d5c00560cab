//! # Dataset Schema
//!
//! Adapter-facing schema vocabulary: table keys, field catalogs, typed record
//! values and the identifier sanitization every physical name goes through.

pub mod descriptor;
pub mod record;
pub mod sanitize;

pub use descriptor::{DatasetDescriptor, FieldSpec, SemanticType, TableKey};
pub use record::{FieldValue, Record, RecordBatch, record};
pub use sanitize::{column_name, physical_table_name, sanitize_identifier};
