//! Adapter registry
//!
//! Source name to adapter table, built once at startup and handed to the job
//! manager.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::{Adapter, AdapterMetadata};
use crate::error::{IngestError, IngestResult};

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    metadata: HashMap<String, AdapterMetadata>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under `metadata.name`, replacing any previous entry.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>, metadata: AdapterMetadata) {
        let name = metadata.name.clone();
        self.adapters.insert(name.clone(), adapter);
        self.metadata.insert(name, metadata);
    }

    pub fn get(&self, name: &str) -> IngestResult<Arc<dyn Adapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| IngestError::UnknownSource {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Metadata for all adapters, sorted by name for stable ordering
    pub fn list_metadata(&self) -> Vec<AdapterMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ExampleAdapter;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = AdapterRegistry::new();
        registry.register(
            Arc::new(ExampleAdapter::new()),
            AdapterMetadata::new("zeta", "last"),
        );
        registry.register(
            Arc::new(ExampleAdapter::new()),
            AdapterMetadata::new("alpha", "first"),
        );

        assert!(registry.get("alpha").is_ok());
        assert!(registry.contains("zeta"));
        let names: Vec<_> = registry
            .list_metadata()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_unknown_source() {
        let registry = AdapterRegistry::new();
        match registry.get("census") {
            Err(IngestError::UnknownSource { name }) => assert_eq!(name, "census"),
            _ => panic!("expected unknown source"),
        }
    }
}
