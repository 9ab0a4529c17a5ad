//! Extraction phase: unit planning, artifact output and the worker pool.

pub mod artifacts;
mod scheduler;
mod units;

pub use artifacts::{ArtifactLayout, ArtifactPaths};
pub use scheduler::{existing_fragment, ExtractionResult, ExtractionScheduler, Fragment, UnitOutcome};
pub use units::{plan_units, UnitPlan};
