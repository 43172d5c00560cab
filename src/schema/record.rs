//! Typed record values handed from adapters to the upsert engine.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::Value;

use super::descriptor::SemanticType;

/// A single typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Decimal(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Name of the value's own type, for error text.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Integer(_) => "integer",
            FieldValue::Decimal(_) => "decimal",
            FieldValue::Text(_) => "text",
            FieldValue::Date(_) => "date",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Boolean(_) => "boolean",
        }
    }

    /// Whether a non-null value can be stored in a column of `semantic_type`.
    /// Integers widen into decimal columns.
    pub fn conforms_to(&self, semantic_type: SemanticType) -> bool {
        matches!(
            (self, semantic_type),
            (FieldValue::Null, _)
                | (FieldValue::Integer(_), SemanticType::Integer)
                | (FieldValue::Integer(_), SemanticType::Decimal)
                | (FieldValue::Decimal(_), SemanticType::Decimal)
                | (FieldValue::Text(_), SemanticType::Text)
                | (FieldValue::Date(_), SemanticType::Date)
                | (FieldValue::Timestamp(_), SemanticType::Timestamp)
                | (FieldValue::Boolean(_), SemanticType::Boolean)
        )
    }

    /// Bind value for a column of `semantic_type`; nulls stay typed so the
    /// driver sees the right parameter type.
    pub fn to_value(&self, semantic_type: SemanticType) -> Value {
        match (self, semantic_type) {
            (FieldValue::Integer(v), SemanticType::Decimal) => Some(*v as f64).into(),
            (FieldValue::Integer(v), _) => Some(*v).into(),
            (FieldValue::Decimal(v), _) => Some(*v).into(),
            (FieldValue::Text(v), _) => Some(v.clone()).into(),
            (FieldValue::Date(v), _) => Some(*v).into(),
            (FieldValue::Timestamp(v), _) => Some(*v).into(),
            (FieldValue::Boolean(v), _) => Some(*v).into(),
            (FieldValue::Null, SemanticType::Integer) => None::<i64>.into(),
            (FieldValue::Null, SemanticType::Decimal) => None::<f64>.into(),
            (FieldValue::Null, SemanticType::Text) => None::<String>.into(),
            (FieldValue::Null, SemanticType::Date) => None::<NaiveDate>.into(),
            (FieldValue::Null, SemanticType::Timestamp) => None::<DateTime<Utc>>.into(),
            (FieldValue::Null, SemanticType::Boolean) => None::<bool>.into(),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Decimal(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// One record: declared field name to value. Absent nullable fields read as null.
pub type Record = BTreeMap<String, FieldValue>;

/// Build a [`Record`] from `(field, value)` pairs.
pub fn record<I, K, V>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FieldValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Ordered records an adapter emits for one table key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    records: Vec<Record>,
}

impl RecordBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl From<Vec<Record>> for RecordBatch {
    fn from(records: Vec<Record>) -> Self {
        Self { records }
    }
}

impl FromIterator<Record> for RecordBatch {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widens_into_decimal() {
        let value = FieldValue::Integer(3);
        assert!(value.conforms_to(SemanticType::Decimal));
        assert_eq!(value.to_value(SemanticType::Decimal), Value::Double(Some(3.0)));
        assert!(!FieldValue::Decimal(1.5).conforms_to(SemanticType::Integer));
    }

    #[test]
    fn test_null_binds_as_typed_none() {
        assert_eq!(
            FieldValue::Null.to_value(SemanticType::Integer),
            Value::BigInt(None)
        );
        assert_eq!(FieldValue::Null.to_value(SemanticType::Boolean), Value::Bool(None));
    }

    #[test]
    fn test_record_builder_accepts_options() {
        let row = record([
            ("series_id", FieldValue::from("DFF")),
            ("value", FieldValue::from(None::<f64>)),
        ]);
        assert_eq!(row.get("series_id"), Some(&FieldValue::Text("DFF".into())));
        assert!(row["value"].is_null());
    }
}
