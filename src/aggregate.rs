//! Reduction of unit and level results into one run outcome.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::combine::LevelResult;
use crate::error::{ArtifactError, CombineError, ResolveError};
use crate::extraction::artifacts::{read_json, write_json_pretty};
use crate::extraction::{ExtractionResult, UnitOutcome};
use crate::models::{GroupKey, UnitKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: UnitKey,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelFailure {
    pub level: String,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupFailure {
    pub group: GroupKey,
    pub cause: String,
}

/// Aggregate result of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Outcome {
    pub units_total: usize,
    pub units_succeeded: usize,
    pub levels_total: usize,
    pub levels_combined: usize,
    pub failed_units: Vec<UnitFailure>,
    /// Unit failures in groups configured as tolerated
    pub tolerated_units: Vec<UnitFailure>,
    pub failed_levels: Vec<LevelFailure>,
    /// Levels left without fragments only because of tolerated failures
    pub tolerated_levels: Vec<LevelFailure>,
    pub failed_groups: Vec<GroupFailure>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.failed_units.is_empty() && self.failed_levels.is_empty() && self.failed_groups.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Write the summary (see the `Display` impl) to `w`.
    pub fn write_summary<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write!(w, "{}", self)
    }

    /// Identities to re-run. Tolerated failures are included; their output
    /// is missing all the same.
    pub fn failure_report(&self) -> FailureReport {
        let mut units: Vec<UnitKey> = self
            .failed_units
            .iter()
            .chain(&self.tolerated_units)
            .map(|f| f.unit.clone())
            .collect();
        units.sort();
        FailureReport {
            scope: Vec::new(),
            units,
            levels: self.failed_levels.iter().map(|f| f.level.clone()).collect(),
            groups: self.failed_groups.iter().map(|f| f.group.clone()).collect(),
        }
    }
}

/// One line per failure followed by a totals line.
impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for g in &self.failed_groups {
            writeln!(f, "FAILED group {}: {}", g.group, g.cause)?;
        }
        for u in &self.failed_units {
            writeln!(f, "FAILED unit {}: {}", u.unit, u.cause)?;
        }
        for l in &self.failed_levels {
            writeln!(f, "FAILED level {}: {}", l.level, l.cause)?;
        }
        for u in &self.tolerated_units {
            writeln!(f, "TOLERATED unit {}: {}", u.unit, u.cause)?;
        }
        for l in &self.tolerated_levels {
            writeln!(f, "TOLERATED level {}: {}", l.level, l.cause)?;
        }
        writeln!(
            f,
            "{}/{} units succeeded, {}/{} levels combined{}",
            self.units_succeeded,
            self.units_total,
            self.levels_combined,
            self.levels_total,
            if self.is_success() { "" } else { " - run FAILED" }
        )
    }
}

/// Persisted list of what failed, consumed by the retry entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Country codes the failed run was restricted to; empty for all
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub units: Vec<UnitKey>,
    #[serde(default)]
    pub levels: Vec<String>,
    #[serde(default)]
    pub groups: Vec<GroupKey>,
}

impl FailureReport {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.levels.is_empty() && self.groups.is_empty()
    }

    /// Country codes touched by the report.
    pub fn countries(&self) -> Vec<String> {
        let countries: BTreeSet<String> = self
            .units
            .iter()
            .map(|u| u.country.clone())
            .chain(self.groups.iter().map(|g| g.country.clone()))
            .collect();
        countries.into_iter().collect()
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        write_json_pretty(path, self)
    }
}

/// Decides overall success from unit, level and group results.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    tolerated: Vec<GroupKey>,
}

impl ResultAggregator {
    pub fn new(tolerated: Vec<GroupKey>) -> Self {
        Self { tolerated }
    }

    pub fn aggregate(
        &self,
        rejected_groups: &[(GroupKey, ResolveError)],
        units: &[ExtractionResult],
        levels: &[LevelResult],
    ) -> Outcome {
        let mut outcome = Outcome {
            units_total: units.len(),
            levels_total: levels.len(),
            ..Default::default()
        };

        for result in units {
            match &result.outcome {
                UnitOutcome::Produced(_) => outcome.units_succeeded += 1,
                UnitOutcome::Failed { cause } => {
                    let failure = UnitFailure {
                        unit: result.unit.clone(),
                        cause: cause.clone(),
                    };
                    if self.tolerated.contains(&result.unit.group()) {
                        outcome.tolerated_units.push(failure);
                    } else {
                        outcome.failed_units.push(failure);
                    }
                }
            }
        }

        for level in levels {
            match &level.outcome {
                Ok(_) => outcome.levels_combined += 1,
                Err(e) => {
                    let failure = LevelFailure {
                        level: level.level.clone(),
                        cause: e.to_string(),
                    };
                    let only_tolerated = matches!(e, CombineError::NoFragments { .. })
                        && self.all_units_tolerated(&level.level, units);
                    if only_tolerated {
                        outcome.tolerated_levels.push(failure);
                    } else {
                        outcome.failed_levels.push(failure);
                    }
                }
            }
        }

        outcome.failed_groups = rejected_groups
            .iter()
            .map(|(group, e)| GroupFailure {
                group: group.clone(),
                cause: e.to_string(),
            })
            .collect();

        outcome.failed_units.sort_by(|a, b| a.unit.cmp(&b.unit));
        outcome.tolerated_units.sort_by(|a, b| a.unit.cmp(&b.unit));
        outcome.failed_levels.sort_by(|a, b| a.level.cmp(&b.level));
        outcome.tolerated_levels.sort_by(|a, b| a.level.cmp(&b.level));
        outcome.failed_groups.sort_by(|a, b| a.group.cmp(&b.group));
        outcome
    }

    /// True if `level` has units and every one of them is a tolerated failure.
    fn all_units_tolerated(&self, level: &str, units: &[ExtractionResult]) -> bool {
        let mut level_units = units.iter().filter(|r| r.level() == level).peekable();
        level_units.peek().is_some()
            && level_units.all(|r| !r.is_success() && self.tolerated.contains(&r.unit.group()))
    }
}
