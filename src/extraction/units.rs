//! Expansion of validated entities into extraction units.

use std::collections::BTreeMap;

use tracing::{error, info};

use crate::error::{PartitionError, ResolveError};
use crate::models::{Entity, ExtractionUnit, GroupKey, Slice};
use crate::temporal::{partition, SliceResolver};

/// Planned work for one run.
#[derive(Debug, Default)]
pub struct UnitPlan {
    /// Units in deterministic `(country, level, slice)` order
    pub units: Vec<ExtractionUnit>,
    /// Slices per group; empty when slicing is off
    pub slices: BTreeMap<GroupKey, Vec<Slice>>,
    /// Groups dropped because a slice resolved to no entities
    pub rejected: Vec<(GroupKey, ResolveError)>,
}

impl UnitPlan {
    /// Distinct levels touched by the planned units, sorted.
    pub fn levels(&self) -> Vec<String> {
        let mut levels: Vec<String> = self.units.iter().map(|u| u.group.level.clone()).collect();
        levels.sort();
        levels.dedup();
        levels
    }
}

/// Plan the units of a run.
///
/// Without slicing there is one unit per group. With slicing every group is
/// partitioned and each slice is checked against the entities before it
/// becomes a unit; a group whose partition yields an empty slice is rejected
/// as a whole.
pub fn plan_units(entities: &[Entity], temporal_slicing: bool) -> Result<UnitPlan, PartitionError> {
    // Partition even when slicing is off, so malformed ranges always abort.
    let slices = partition(entities)?;
    let country_names = country_names(entities);

    if !temporal_slicing {
        let units = slices
            .keys()
            .map(|group| ExtractionUnit {
                group: group.clone(),
                country_name: country_names[group].clone(),
                slice: None,
            })
            .collect::<Vec<_>>();
        info!("Planned {} units (one per group)", units.len());
        return Ok(UnitPlan {
            units,
            ..Default::default()
        });
    }

    let resolver = SliceResolver::new(entities);
    let mut plan = UnitPlan::default();

    for (group, group_slices) in slices {
        if let Err(e) = resolver.resolve_all(&group, &group_slices) {
            error!("Rejecting group {}: {}", group, e);
            plan.rejected.push((group, e));
            continue;
        }
        for slice in &group_slices {
            plan.units.push(ExtractionUnit {
                group: group.clone(),
                country_name: country_names[&group].clone(),
                slice: Some(slice.range()),
            });
        }
        plan.slices.insert(group, group_slices);
    }

    info!(
        "Planned {} units across {} groups ({} rejected)",
        plan.units.len(),
        plan.slices.len(),
        plan.rejected.len()
    );
    Ok(plan)
}

fn country_names(entities: &[Entity]) -> BTreeMap<GroupKey, String> {
    let mut names = BTreeMap::new();
    for entity in entities {
        names
            .entry(entity.group.clone())
            .or_insert_with(|| entity.country_name.clone());
    }
    names
}
