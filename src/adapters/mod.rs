//! Adapters module
//!
//! The contract source-specific code implements to ride on the orchestration
//! core:
//! - the [`Adapter`] trait (`validate`, `describe`, `fetch`)
//! - [`BatchEmitter`] and [`FetchContext`], handed to adapters during a run
//! - the [`AdapterRegistry`] the job manager resolves sources through
//! - a reference [`ExampleAdapter`] for observation-series APIs

pub mod example;
pub mod metadata;
pub mod registry;
pub mod trait_;

pub use example::{ExampleAdapter, register_example_adapter};
pub use metadata::AdapterMetadata;
pub use registry::AdapterRegistry;
pub use trait_::{Adapter, BatchEmitter, EmittedBatch, FetchContext, JobConfig};
