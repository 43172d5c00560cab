//! # Data Models
//!
//! SeaORM entities for the core-owned tables.

pub mod dataset_registry;
pub mod job;

pub use dataset_registry::Entity as DatasetRegistryEntry;
pub use job::Entity as Job;
pub use job::JobStatus;
