//! Example adapter implementation
//!
//! A reference adapter for observation-series APIs shaped like
//! `GET {base_url}/series/observations?series_id=..` returning
//! `{"observations":[{"date":"YYYY-MM-DD","value":"1.23"}]}`, where a value of
//! `"."` marks a missing observation. It can be registered under any source
//! name that speaks this shape.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use url::Url;

use crate::adapters::{
    Adapter, AdapterMetadata, AdapterRegistry, BatchEmitter, FetchContext, JobConfig,
};
use crate::error::{IngestError, IngestResult};
use crate::fetch::FetchRequest;
use crate::schema::{
    DatasetDescriptor, FieldSpec, FieldValue, RecordBatch, SemanticType, TableKey, record,
};

pub const EXAMPLE_SOURCE: &str = "example";
pub const OBSERVATIONS_DATASET: &str = "observations";

/// Strongly-typed view of the opaque job config.
#[derive(Debug, Clone, Deserialize)]
struct ExampleConfig {
    series: Vec<String>,
    start: NaiveDate,
    end: NaiveDate,
    base_url: Url,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObservationsPayload {
    observations: Vec<Observation>,
}

#[derive(Debug, Deserialize)]
struct Observation {
    date: String,
    value: String,
}

pub struct ExampleAdapter {
    source: String,
}

impl ExampleAdapter {
    pub fn new() -> Self {
        Self::with_source(EXAMPLE_SOURCE)
    }

    /// Same adapter registered under another source name.
    pub fn with_source<S: Into<String>>(source: S) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn table_key(&self) -> TableKey {
        TableKey::new(self.source.as_str(), OBSERVATIONS_DATASET)
    }

    fn parse(config: &JobConfig) -> IngestResult<ExampleConfig> {
        let object: serde_json::Map<String, JsonValue> =
            config.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let parsed: ExampleConfig = serde_json::from_value(JsonValue::Object(object))
            .map_err(|e| IngestError::invalid_config(e.to_string()))?;

        if parsed.series.is_empty() {
            return Err(IngestError::invalid_config("'series' must not be empty"));
        }
        if parsed.series.iter().any(|s| s.trim().is_empty()) {
            return Err(IngestError::invalid_config(
                "'series' entries must be non-empty strings",
            ));
        }
        if parsed.start > parsed.end {
            return Err(IngestError::invalid_config(format!(
                "'start' ({}) is after 'end' ({})",
                parsed.start, parsed.end
            )));
        }
        if !matches!(parsed.base_url.scheme(), "http" | "https") {
            return Err(IngestError::invalid_config(
                "'base_url' must be an http(s) URL",
            ));
        }
        Ok(parsed)
    }

    fn observations_url(config: &ExampleConfig, series_id: &str) -> IngestResult<Url> {
        let mut url = config.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| IngestError::invalid_config("'base_url' cannot be a base"))?
            .pop_if_empty()
            .extend(["series", "observations"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("series_id", series_id)
                .append_pair("observation_start", &config.start.to_string())
                .append_pair("observation_end", &config.end.to_string())
                .append_pair("file_type", "json");
            if let Some(api_key) = &config.api_key {
                query.append_pair("api_key", api_key);
            }
        }
        Ok(url)
    }

    fn to_batch(series_id: &str, payload: ObservationsPayload) -> IngestResult<RecordBatch> {
        payload
            .observations
            .into_iter()
            .map(|obs| {
                let date = NaiveDate::parse_from_str(&obs.date, "%Y-%m-%d").map_err(|e| {
                    IngestError::adapter(format!(
                        "series {series_id}: bad observation date '{}': {e}",
                        obs.date
                    ))
                })?;
                let value = match obs.value.trim() {
                    "." | "" => FieldValue::Null,
                    raw => FieldValue::Decimal(raw.parse::<f64>().map_err(|e| {
                        IngestError::adapter(format!(
                            "series {series_id}: bad value '{raw}' on {date}: {e}"
                        ))
                    })?),
                };
                Ok(record([
                    ("series_id", FieldValue::from(series_id)),
                    ("date", FieldValue::Date(date)),
                    ("value", value),
                ]))
            })
            .collect()
    }
}

impl Default for ExampleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for ExampleAdapter {
    fn validate(&self, config: &JobConfig) -> IngestResult<()> {
        Self::parse(config).map(|_| ())
    }

    async fn describe(
        &self,
        _config: &JobConfig,
        _ctx: &FetchContext,
    ) -> IngestResult<Vec<DatasetDescriptor>> {
        Ok(vec![
            DatasetDescriptor::new(self.table_key())
                .field(FieldSpec::required("series_id", SemanticType::Text))
                .field(FieldSpec::required("date", SemanticType::Date))
                .field(FieldSpec::optional("value", SemanticType::Decimal))
                .with_conflict_key(["series_id", "date"]),
        ])
    }

    async fn fetch(
        &self,
        config: &JobConfig,
        ctx: &FetchContext,
        emit: BatchEmitter,
    ) -> IngestResult<()> {
        let config = Self::parse(config)?;
        let table_key = self.table_key();

        for series_id in &config.series {
            let url = Self::observations_url(&config, series_id)?;
            let response = ctx
                .fetch(&FetchRequest::get(ctx.source.as_str(), url))
                .await?;
            let payload: ObservationsPayload = response.json()?;
            let batch = Self::to_batch(series_id, payload)?;

            debug!(series_id = %series_id, rows = batch.len(), "Fetched observations");
            if !batch.is_empty() {
                emit.emit(&table_key, batch).await?;
            }
        }

        info!(
            job_id = ctx.job_id,
            series = config.series.len(),
            "Example adapter finished"
        );
        Ok(())
    }
}

/// Register the example adapter under its default source name.
pub fn register_example_adapter(registry: &mut AdapterRegistry) {
    registry.register(
        Arc::new(ExampleAdapter::new()),
        AdapterMetadata::new(
            EXAMPLE_SOURCE,
            "Observation series API (series/observations endpoint)",
        )
        .with_datasets([OBSERVATIONS_DATASET]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: JsonValue) -> JobConfig {
        serde_json::from_value(value).unwrap()
    }

    fn valid() -> JobConfig {
        config(json!({
            "series": ["DFF"],
            "start": "2020-01-01",
            "end": "2020-01-03",
            "base_url": "http://localhost:1234/fred"
        }))
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        assert!(ExampleAdapter::new().validate(&valid()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let adapter = ExampleAdapter::new();
        let cases = [
            json!({"series": [], "start": "2020-01-01", "end": "2020-01-03", "base_url": "http://x"}),
            json!({"series": ["DFF"], "start": "2020-02-01", "end": "2020-01-03", "base_url": "http://x"}),
            json!({"series": ["DFF"], "start": "yesterday", "end": "2020-01-03", "base_url": "http://x"}),
            json!({"series": ["DFF"], "start": "2020-01-01", "end": "2020-01-03", "base_url": "ftp://x"}),
            json!({"series": ["DFF"], "start": "2020-01-01", "end": "2020-01-03"}),
        ];
        for case in cases {
            let err = adapter.validate(&config(case.clone())).unwrap_err();
            assert_eq!(err.kind(), "invalid_config", "{case}");
        }
    }

    #[test]
    fn test_observations_url() {
        let parsed = ExampleAdapter::parse(&valid()).unwrap();
        let url = ExampleAdapter::observations_url(&parsed, "DFF").unwrap();
        assert_eq!(url.path(), "/fred/series/observations");
        let query: Vec<_> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("series_id".into(), "DFF".into())));
        assert!(query.contains(&("observation_start".into(), "2020-01-01".into())));
        assert!(query.contains(&("observation_end".into(), "2020-01-03".into())));
    }

    #[test]
    fn test_dot_value_maps_to_null() {
        let payload: ObservationsPayload = serde_json::from_value(json!({
            "observations": [
                {"date": "2020-01-01", "value": "1.55"},
                {"date": "2020-01-02", "value": "."}
            ]
        }))
        .unwrap();
        let batch = ExampleAdapter::to_batch("DFF", payload).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records()[0]["value"], FieldValue::Decimal(1.55));
        assert!(batch.records()[1]["value"].is_null());
    }

    #[test]
    fn test_bad_value_is_adapter_error() {
        let payload = ObservationsPayload {
            observations: vec![Observation {
                date: "2020-01-01".into(),
                value: "n/a".into(),
            }],
        };
        let err = ExampleAdapter::to_batch("DFF", payload).unwrap_err();
        assert_eq!(err.kind(), "adapter_error");
    }
}
