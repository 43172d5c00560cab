//! Adapter metadata types

use serde::{Deserialize, Serialize};

/// Descriptive information about a registered adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    /// Source name jobs are submitted under
    pub name: String,
    /// Human-readable summary of the upstream API
    pub description: String,
    /// Logical datasets the adapter usually writes
    pub datasets: Vec<String>,
}

impl AdapterMetadata {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            datasets: Vec::new(),
        }
    }

    pub fn with_datasets<I, S>(mut self, datasets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.datasets = datasets.into_iter().map(Into::into).collect();
        self
    }
}
