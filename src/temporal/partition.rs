//! Temporal interval partitioning.
//!
//! For every `(country, level)` group the start years and one-past-end years
//! of its entities become cut points. Consecutive cut points bound a slice,
//! so no entity's validity ever partially overlaps a slice.

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::debug;

use crate::error::PartitionError;
use crate::models::{Entity, GroupKey, Slice, Validity};

/// Compute the disjoint slices of every group present in `entities`.
///
/// Fails before any slicing happens if one entity has an inverted range.
pub fn partition(entities: &[Entity]) -> Result<BTreeMap<GroupKey, Vec<Slice>>, PartitionError> {
    for entity in entities {
        check_range(entity)?;
    }

    let mut groups: BTreeMap<&GroupKey, Vec<Validity>> = BTreeMap::new();
    for entity in entities {
        groups.entry(&entity.group).or_default().push(entity.validity);
    }

    let sliced: Vec<(GroupKey, Vec<Slice>)> = groups
        .into_par_iter()
        .map(|(group, ranges)| {
            let slices = slice_group(group, &ranges);
            debug!("{}: {} ranges -> {} slices", group, ranges.len(), slices.len());
            (group.clone(), slices)
        })
        .collect();

    Ok(sliced.into_iter().collect())
}

/// Slices for a single group. Ranges must already be well-formed.
pub fn slice_group(group: &GroupKey, ranges: &[Validity]) -> Vec<Slice> {
    // i64 so that `OPEN_END + 1` does not overflow
    let mut boundaries: Vec<i64> = Vec::with_capacity(ranges.len() * 2);
    for range in ranges {
        boundaries.push(i64::from(range.start));
        boundaries.push(i64::from(range.end) + 1);
    }
    boundaries.sort_unstable();
    boundaries.dedup();

    boundaries
        .windows(2)
        .map(|pair| {
            // Both values come from i32 inputs, so `b - 1` fits in i32.
            let start = pair[0] as i32;
            let end = (pair[1] - 1) as i32;
            Slice::new(group.clone(), start, end)
        })
        .collect()
}

fn check_range(entity: &Entity) -> Result<(), PartitionError> {
    if entity.validity.start > entity.validity.end {
        return Err(PartitionError::InvertedRange {
            id: entity.id.clone(),
            group: entity.group.clone(),
            start: entity.validity.start,
            end: entity.validity.end,
        });
    }
    Ok(())
}
