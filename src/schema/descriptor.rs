//! Dataset descriptors: what an adapter declares it will write.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::sanitize::column_name;
use crate::error::{IngestError, IngestResult};

/// Deterministic identifier combining source and logical dataset name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    source: String,
    dataset: String,
}

impl TableKey {
    pub fn new<S: Into<String>, D: Into<String>>(source: S, dataset: D) -> Self {
        Self {
            source: source.into(),
            dataset: dataset.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.dataset)
    }
}

impl FromStr for TableKey {
    type Err = IngestError;

    /// Parses `"<source>.<dataset>"`; the dataset part may itself contain dots.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('.') {
            Some((source, dataset)) if !source.is_empty() && !dataset.is_empty() => {
                Ok(TableKey::new(source, dataset))
            }
            _ => Err(IngestError::invalid_descriptor(
                value,
                "table key must look like '<source>.<dataset>'",
            )),
        }
    }
}

/// Storage-agnostic column types an adapter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Integer,
    Decimal,
    Text,
    Date,
    Timestamp,
    Boolean,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Integer => "integer",
            SemanticType::Decimal => "decimal",
            SemanticType::Text => "text",
            SemanticType::Date => "date",
            SemanticType::Timestamp => "timestamp",
            SemanticType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
}

impl FieldSpec {
    pub fn new<N: Into<String>>(name: N, semantic_type: SemanticType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable,
        }
    }

    pub fn required<N: Into<String>>(name: N, semantic_type: SemanticType) -> Self {
        Self::new(name, semantic_type, false)
    }

    pub fn optional<N: Into<String>>(name: N, semantic_type: SemanticType) -> Self {
        Self::new(name, semantic_type, true)
    }

    pub fn column(&self) -> String {
        column_name(&self.name)
    }
}

/// An adapter's declaration of one table it will write during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub table_key: TableKey,
    pub fields: Vec<FieldSpec>,
    pub conflict_key: Vec<String>,
}

impl DatasetDescriptor {
    pub fn new(table_key: TableKey) -> Self {
        Self {
            table_key,
            fields: Vec::new(),
            conflict_key: Vec::new(),
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn with_conflict_key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_key = key.into_iter().map(Into::into).collect();
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check the structural rules a descriptor must satisfy before anything
    /// touches storage.
    pub fn validate(&self) -> IngestResult<()> {
        let key = self.table_key.to_string();
        let invalid = |reason: String| IngestError::invalid_descriptor(key.clone(), reason);

        if self.table_key.source().is_empty() || self.table_key.dataset().is_empty() {
            return Err(invalid("source and dataset must be non-empty".into()));
        }

        if self.fields.is_empty() {
            return Err(invalid("at least one field is required".into()));
        }

        let mut names = HashSet::new();
        let mut columns = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(invalid("field names must be non-empty".into()));
            }
            if !names.insert(field.name.as_str()) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
            if !columns.insert(field.column()) {
                return Err(invalid(format!(
                    "field '{}' maps to column '{}' which is already taken",
                    field.name,
                    field.column()
                )));
            }
        }

        if self.conflict_key.is_empty() {
            return Err(invalid("conflict key must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for name in &self.conflict_key {
            if !seen.insert(name.as_str()) {
                return Err(invalid(format!("conflict key repeats field '{name}'")));
            }
            match self.find_field(name) {
                None => {
                    return Err(invalid(format!(
                        "conflict key field '{name}' is not a declared field"
                    )));
                }
                Some(field) if field.nullable => {
                    return Err(invalid(format!(
                        "conflict key field '{name}' must not be nullable"
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}
