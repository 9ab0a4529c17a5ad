//! Temporal slicing of region groups.
//!
//! Partitions each `(country, level)` group into disjoint year ranges over
//! which the set of valid regions is constant, and resolves which regions
//! are active in a given range.

mod partition;
mod resolve;

pub use partition::{partition, slice_group};
pub use resolve::SliceResolver;
