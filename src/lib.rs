//! # Ingestor
//!
//! Orchestration core for ingesting government statistical APIs into a
//! relational store: job lifecycle, rate-limited fetching, schema
//! materialization and idempotent upserts, with source adapters plugged in
//! through the [`adapters::Adapter`] trait.

pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod job_manager;
pub mod materializer;
pub mod models;
pub mod repositories;
pub mod schema;
pub mod telemetry;
pub mod upsert;
pub use migration;

pub use error::{IngestError, IngestResult};
pub use job_manager::{JobHandle, JobManager};
