//! Core data models for region extraction.

pub mod collection;
pub mod entity;
pub mod unit;

pub use collection::{FeatureCollection, DEFAULT_CRS};
pub use entity::{DictionaryRow, Entity, FetchSelector, GroupKey, Validity, OPEN_END, OPEN_START};
pub use unit::{ExtractionUnit, Slice, UnitKey};
