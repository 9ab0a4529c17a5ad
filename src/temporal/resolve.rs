//! Resolve the active entity set of a slice.

use std::collections::BTreeMap;

use crate::error::ResolveError;
use crate::models::{Entity, GroupKey, Slice};

/// Index of entities by group, answering which entities are active over a
/// given slice.
pub struct SliceResolver<'a> {
    by_group: BTreeMap<&'a GroupKey, Vec<&'a Entity>>,
}

impl<'a> SliceResolver<'a> {
    pub fn new(entities: &'a [Entity]) -> Self {
        let mut by_group: BTreeMap<&GroupKey, Vec<&Entity>> = BTreeMap::new();
        for entity in entities {
            by_group.entry(&entity.group).or_default().push(entity);
        }
        for members in by_group.values_mut() {
            members.sort_by(|a, b| {
                a.validity
                    .start
                    .cmp(&b.validity.start)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        Self { by_group }
    }

    /// Every entity of `group` whose validity fully contains `slice`,
    /// ordered by start year.
    ///
    /// An empty result means the partition and the data disagree, and is
    /// reported as an error rather than an empty list.
    pub fn resolve(&self, group: &GroupKey, slice: &Slice) -> Result<Vec<&'a Entity>, ResolveError> {
        let range = slice.range();
        let active: Vec<&Entity> = self
            .by_group
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|e| e.validity.contains(&range))
                    .collect()
            })
            .unwrap_or_default();

        if active.is_empty() {
            return Err(ResolveError::EmptySlice {
                group: group.clone(),
                slice: slice.clone(),
            });
        }
        Ok(active)
    }

    /// Resolve every slice of a group, stopping at the first empty one.
    pub fn resolve_all(
        &self,
        group: &GroupKey,
        slices: &[Slice],
    ) -> Result<Vec<(Slice, Vec<&'a Entity>)>, ResolveError> {
        slices
            .iter()
            .map(|slice| Ok((slice.clone(), self.resolve(group, slice)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Validity, OPEN_END};
    use crate::temporal::partition;

    fn entity(id: &str, start: i32, end: i32) -> Entity {
        Entity {
            id: id.to_string(),
            group: GroupKey::new("BR", "state"),
            country_name: "BRAZIL".to_string(),
            level_name: None,
            parent: None,
            validity: Validity::new(start, end),
            regions_count: 1,
        }
    }

    fn ids(active: &[&Entity]) -> Vec<String> {
        active.iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_overlap_active_sets() {
        let entities = vec![entity("a", 2000, 2015), entity("b", 2010, 2020)];
        let group = GroupKey::new("BR", "state");
        let slices = partition(&entities).unwrap().remove(&group).unwrap();
        let resolver = SliceResolver::new(&entities);

        let resolved = resolver.resolve_all(&group, &slices).unwrap();
        let sets: Vec<Vec<String>> = resolved.iter().map(|(_, a)| ids(a)).collect();
        assert_eq!(sets, vec![vec!["a"], vec!["a", "b"], vec!["b"]]);
    }

    #[test]
    fn test_open_ended_entity_is_active_in_terminal_slice() {
        let entities = vec![entity("a", 2000, 2010), entity("b", 2011, OPEN_END)];
        let group = GroupKey::new("BR", "state");
        let resolver = SliceResolver::new(&entities);
        let slice = Slice::new(group.clone(), 2011, OPEN_END);
        assert_eq!(ids(&resolver.resolve(&group, &slice).unwrap()), vec!["b"]);
    }

    #[test]
    fn test_gap_slice_is_an_error() {
        let entities = vec![entity("a", 2000, 2005), entity("b", 2010, 2015)];
        let group = GroupKey::new("BR", "state");
        let slices = partition(&entities).unwrap().remove(&group).unwrap();
        let resolver = SliceResolver::new(&entities);

        let err = resolver.resolve_all(&group, &slices).unwrap_err();
        match err {
            ResolveError::EmptySlice { slice, .. } => {
                assert_eq!((slice.start, slice.end), (2006, 2009));
            }
        }
    }

    #[test]
    fn test_unknown_group_is_empty() {
        let entities = vec![entity("a", 2000, 2005)];
        let resolver = SliceResolver::new(&entities);
        let other = GroupKey::new("AR", "province");
        let slice = Slice::new(other.clone(), 2000, 2005);
        assert!(resolver.resolve(&other, &slice).is_err());
    }
}
