//! Pipeline jobs for Sluice.
//!
//! Each job runs against any [`sluice_core::store::PipelineStore`], bounds
//! every store call with the configured timeout, and is wrapped in a run
//! record so failures are always visible after the fact.

pub mod config;
pub mod curated;
pub mod drift;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod pipeline;
pub mod quality;
pub mod recorder;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use pipeline::{IngestRequest, Pipeline, StatusReport};
pub use recorder::{Bounded, JobReport, RunRecorder};
