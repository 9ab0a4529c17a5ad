//! Time slices and the units of concurrent extraction work.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::entity::{FetchSelector, GroupKey, Validity};

/// A maximal interval within one group over which the set of active
/// entities does not change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slice {
    pub group: GroupKey,
    pub start: i32,
    pub end: i32,
}

impl Slice {
    pub fn new(group: GroupKey, start: i32, end: i32) -> Self {
        debug_assert!(start <= end);
        Self { group, start, end }
    }

    pub fn range(&self) -> Validity {
        Validity::new(self.start, self.end)
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.group, self.range())
    }
}

/// Identity of an extraction unit. Stable across runs, so it can be written
/// to a failure report and matched again on retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub country: String,
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice: Option<Validity>,
}

impl UnitKey {
    pub fn group(&self) -> GroupKey {
        GroupKey::new(&self.country, &self.level)
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.country, self.level)?;
        if let Some(slice) = self.slice {
            write!(f, " {}", slice)?;
        }
        Ok(())
    }
}

/// One independently schedulable extraction task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtractionUnit {
    pub group: GroupKey,
    /// Name the store knows the country by
    pub country_name: String,
    pub slice: Option<Validity>,
}

impl ExtractionUnit {
    pub fn key(&self) -> UnitKey {
        UnitKey {
            country: self.group.country.clone(),
            level: self.group.level.clone(),
            slice: self.slice,
        }
    }

    pub fn level(&self) -> &str {
        &self.group.level
    }

    pub fn selector(&self) -> FetchSelector {
        FetchSelector {
            country_name: self.country_name.clone(),
            country_code: self.group.country.clone(),
            level: self.group.level.clone(),
            years: self.slice,
        }
    }
}

impl fmt::Display for ExtractionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}
