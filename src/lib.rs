//! regionslice - extraction of administrative region geometry into
//! per-country and per-level GeoJSON and TopoJSON files.
//!
//! This library provides the planning, extraction and combine phases shared by
//! the extract and publish binaries.

pub mod aggregate;
pub mod combine;
pub mod config;
pub mod error;
pub mod extraction;
pub mod manifest;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod store;
pub mod temporal;
pub mod topology;
pub mod upload;

pub use aggregate::{FailureReport, Outcome, ResultAggregator};
pub use config::Config;
pub use models::{Entity, ExtractionUnit, GroupKey, Slice, UnitKey, Validity};
pub use pipeline::{Pipeline, PipelineOptions};
