//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! core-owned tables.

pub mod dataset_registry;
pub mod job;

pub use dataset_registry::{DatasetRegistry, RegistryEntry};
pub use job::{JobFilter, JobRepository};
