//! Region cohorts as enumerated by the dictionary query.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Start year used when a region has no recorded start.
pub const OPEN_START: i32 = 1;

/// End year used when a region is still valid.
pub const OPEN_END: i32 = i32::MAX;

static COUNTRY_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{2}$").expect("static regex"));

/// Inclusive range of years over which something is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Validity {
    pub start: i32,
    pub end: i32,
}

impl Validity {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    /// Fill in missing bounds with the open sentinels.
    pub fn from_optional(start: Option<i32>, end: Option<i32>) -> Self {
        Self {
            start: start.unwrap_or(OPEN_START),
            end: end.unwrap_or(OPEN_END),
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == OPEN_END
    }

    /// True if `other` lies entirely inside this range.
    pub fn contains(&self, other: &Validity) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Short tag used in file names, e.g. `2000-2010` or `2011-present`.
    pub fn tag(&self) -> String {
        if self.is_open_ended() {
            format!("{}-present", self.start)
        } else {
            format!("{}-{}", self.start, self.end)
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open_ended() {
            write!(f, "[{}, open]", self.start)
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}

/// The `(country, level)` partition unit for temporal slicing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    /// Upper-cased two letter country code
    pub country: String,
    /// Administrative tier slug, e.g. `municipality`
    pub level: String,
}

impl GroupKey {
    pub fn new(country: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            country: country.into().to_uppercase(),
            level: level.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.country, self.level)
    }
}

impl FromStr for GroupKey {
    type Err = String;

    /// Parse the `CC/level` form used in configuration.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((country, level)) if !country.is_empty() && !level.is_empty() => {
                Ok(GroupKey::new(country, level))
            }
            _ => Err(format!("expected COUNTRY/level, got {:?}", s)),
        }
    }
}

/// One row of the dictionary query: a cohort of regions in one group that
/// share a validity range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryRow {
    pub country_name: String,
    pub country_code: String,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_start: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_end: Option<i32>,
    pub regions_count: i64,
}

impl DictionaryRow {
    /// Reject rows that are missing what partitioning and naming rely on.
    pub fn validate(&self) -> Result<(), StoreError> {
        let malformed = |reason: String| Err(StoreError::MalformedRow { reason });

        if !COUNTRY_CODE.is_match(&self.country_code) {
            return malformed(format!("invalid country code {:?}", self.country_code));
        }
        if self.country_name.trim().is_empty() {
            return malformed(format!("missing country name for {}", self.country_code));
        }
        if self.level.trim().is_empty() {
            return malformed(format!("missing level for {}", self.country_code));
        }
        if self.level.contains(['/', '\\']) {
            return malformed(format!("level {:?} is not a valid path segment", self.level));
        }
        if self.regions_count < 1 {
            return malformed(format!(
                "{}/{} has no regions (count {})",
                self.country_code, self.level, self.regions_count
            ));
        }
        Ok(())
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.country_code, &self.level)
    }

    pub fn validity(&self) -> Validity {
        Validity::from_optional(self.year_start, self.year_end)
    }

    /// Validate the row and turn it into an [`Entity`].
    pub fn into_entity(self) -> Result<Entity, StoreError> {
        self.validate()?;
        let group = self.group_key();
        let validity = self.validity();
        Ok(Entity {
            id: format!("{}:{}", group, validity.tag()),
            group,
            country_name: self.country_name,
            level_name: self.level_name,
            parent: self.parent_level,
            validity,
            regions_count: self.regions_count,
        })
    }
}

/// One administrative region version (or a cohort of regions sharing
/// identity and validity within a group).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub group: GroupKey,
    pub country_name: String,
    pub level_name: Option<String>,
    /// Level of the parent region, if any
    pub parent: Option<String>,
    pub validity: Validity,
    pub regions_count: i64,
}

/// Arguments to the geometry query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchSelector {
    pub country_name: String,
    pub country_code: String,
    pub level: String,
    /// Restrict to regions valid over this whole range
    pub years: Option<Validity>,
}

impl fmt::Display for FetchSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.country_code, self.level)?;
        if let Some(years) = self.years {
            write!(f, " {}", years)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> DictionaryRow {
        DictionaryRow {
            country_name: "BRAZIL".to_string(),
            country_code: "BR".to_string(),
            level: "municipality".to_string(),
            level_name: Some("Municipality".to_string()),
            parent_level: Some("state".to_string()),
            year_start: None,
            year_end: None,
            regions_count: 5570,
        }
    }

    #[test]
    fn test_missing_bounds_default_to_sentinels() {
        let entity = row().into_entity().unwrap();
        assert_eq!(entity.validity, Validity::new(OPEN_START, OPEN_END));
        assert!(entity.validity.is_open_ended());
        assert_eq!(entity.id, "BR/municipality:1-present");
    }

    #[test]
    fn test_rejects_bad_country_code() {
        let mut r = row();
        r.country_code = "BRA".to_string();
        assert!(matches!(r.validate(), Err(StoreError::MalformedRow { .. })));
    }

    #[test]
    fn test_rejects_empty_level_and_zero_count() {
        let mut r = row();
        r.level = "  ".to_string();
        assert!(r.validate().is_err());

        let mut r = row();
        r.regions_count = 0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_group_key_is_uppercased_and_parses() {
        let key = GroupKey::new("id", "wood-pulp-concession");
        assert_eq!(key.to_string(), "ID/wood-pulp-concession");
        assert_eq!("ID/wood-pulp-concession".parse::<GroupKey>().unwrap(), key);
        assert!("nolevel".parse::<GroupKey>().is_err());
    }

    #[test]
    fn test_validity_tag() {
        assert_eq!(Validity::new(2000, 2010).tag(), "2000-2010");
        assert_eq!(Validity::new(2011, OPEN_END).tag(), "2011-present");
    }
}
