//! Core types and trait definitions for the Sluice pipeline.
//!
//! This crate is deliberately free of database and runtime dependencies.
//! It holds the domain model, the [`store::PipelineStore`] abstraction, and
//! the pure algorithms (identity resolution, schema diffing, timestamp
//! handling) that every other crate builds on.

pub mod curated;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod quality;
pub mod record;
pub mod run;
pub mod schema;
pub mod source;
pub mod store;
pub mod table;
pub mod watermark;

pub use error::{Error, Result};
pub use table::TableName;
