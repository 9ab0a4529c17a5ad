//! The `metadata.json` listing of per-group outputs.
//!
//! Records are computed from the unit plan, so they describe the artifacts a
//! run intends to produce. A record does not prove its files exist; the
//! failure report lists what did not materialize.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ArtifactError, ConfigError};
use crate::extraction::artifacts::{read_json, write_json_pretty};
use crate::extraction::{ArtifactLayout, UnitPlan};
use crate::models::{Entity, GroupKey, UnitKey, Validity, OPEN_END};

/// Paths relative to the output root and their public URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLinks {
    pub path_geojson: String,
    pub path_topojson: String,
    pub url_geojson: String,
    pub url_topojson: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub year_start: i32,
    /// Absent for a slice that is still open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_end: Option<i32>,
    #[serde(flatten)]
    pub links: ArtifactLinks,
}

/// One record per group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub country: String,
    pub country_code: String,
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_level: Option<String>,
    pub year_start: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_end: Option<i32>,
    pub regions_count: i64,
    /// Whole-group artifacts; absent when the group is sliced
    #[serde(flatten)]
    pub links: Option<ArtifactLinks>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slices: Vec<SliceRecord>,
}

pub struct ManifestBuilder<'a> {
    layout: &'a ArtifactLayout,
    base_url: Url,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(layout: &'a ArtifactLayout, base_url: &str) -> Result<Self, ConfigError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ConfigError::Invalid(format!("base url {:?}: {}", base_url, e)))?;
        // Url::join replaces the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { layout, base_url })
    }

    /// Build one record for every group with planned units.
    pub fn build(&self, entities: &[Entity], plan: &UnitPlan) -> Vec<ManifestRecord> {
        let mut by_group: BTreeMap<&GroupKey, Vec<&Entity>> = BTreeMap::new();
        for entity in entities {
            by_group.entry(&entity.group).or_default().push(entity);
        }

        let mut units_by_group: BTreeMap<GroupKey, Vec<UnitKey>> = BTreeMap::new();
        for unit in &plan.units {
            units_by_group
                .entry(unit.group.clone())
                .or_default()
                .push(unit.key());
        }

        units_by_group
            .into_iter()
            .filter_map(|(group, units)| {
                let members = by_group.get(&group)?;
                Some(self.record(&group, members, &units))
            })
            .collect()
    }

    fn record(&self, group: &GroupKey, members: &[&Entity], units: &[UnitKey]) -> ManifestRecord {
        let first = members[0];
        let year_start = members.iter().map(|e| e.validity.start).min().unwrap_or(first.validity.start);
        let year_end = members.iter().map(|e| e.validity.end).max().unwrap_or(first.validity.end);

        let mut links = None;
        let mut slices = Vec::new();
        for unit in units {
            let unit_links = self.links(unit);
            match unit.slice {
                None => links = Some(unit_links),
                Some(range) => slices.push(SliceRecord {
                    year_start: range.start,
                    year_end: open_end(range),
                    links: unit_links,
                }),
            }
        }

        ManifestRecord {
            country: first.country_name.clone(),
            country_code: group.country.clone(),
            level: group.level.clone(),
            level_name: first.level_name.clone(),
            parent_level: first.parent.clone(),
            year_start,
            year_end: open_end(Validity::new(year_start, year_end)),
            regions_count: members.iter().map(|e| e.regions_count).sum(),
            links,
            slices,
        }
    }

    fn links(&self, unit: &UnitKey) -> ArtifactLinks {
        let (path_geojson, path_topojson) = self.layout.relative(&ArtifactLayout::fragment_stem(unit));
        ArtifactLinks {
            url_geojson: self.url(&path_geojson),
            url_topojson: self.url(&path_topojson),
            path_geojson,
            path_topojson,
        }
    }

    fn url(&self, relative: &str) -> String {
        match self.base_url.join(relative) {
            Ok(url) => url.to_string(),
            // Relative paths built from validated segments always join.
            Err(_) => format!("{}{}", self.base_url, relative),
        }
    }
}

fn open_end(range: Validity) -> Option<i32> {
    (range.end != OPEN_END).then_some(range.end)
}

/// Write the manifest to its place under the output root.
pub fn write_manifest(layout: &ArtifactLayout, records: &[ManifestRecord]) -> Result<PathBuf, ArtifactError> {
    let path = layout.manifest_path();
    write_json_pretty(&path, records)?;
    Ok(path)
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRecord>, ArtifactError> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::plan_units;
    use crate::models::DictionaryRow;

    fn entity(cc: &str, level: &str, start: Option<i32>, end: Option<i32>, count: i64) -> Entity {
        DictionaryRow {
            country_name: format!("{} country", cc),
            country_code: cc.to_string(),
            level: level.to_string(),
            level_name: Some(level.to_uppercase()),
            parent_level: None,
            year_start: start,
            year_end: end,
            regions_count: count,
        }
        .into_entity()
        .unwrap()
    }

    fn layout() -> ArtifactLayout {
        ArtifactLayout::new("/tmp/out", "geojson", "topo.json")
    }

    #[test]
    fn test_unsliced_records() {
        let entities = vec![
            entity("BR", "state", None, None, 27),
            entity("AR", "province", None, None, 24),
        ];
        let plan = plan_units(&entities, false).unwrap();
        let layout = layout();
        let records = ManifestBuilder::new(&layout, "https://cdn.example.org/regions")
            .unwrap()
            .build(&entities, &plan);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].country_code, "AR");
        let links = records[1].links.as_ref().unwrap();
        assert_eq!(links.path_geojson, "br/state.geojson");
        assert_eq!(links.path_topojson, "br/state.topo.json");
        assert_eq!(links.url_geojson, "https://cdn.example.org/regions/br/state.geojson");
        assert!(records[1].slices.is_empty());
        assert_eq!(records[1].year_end, None);
    }

    #[test]
    fn test_sliced_records_list_each_slice() {
        let entities = vec![
            entity("BR", "municipality", Some(2000), Some(2010), 5000),
            entity("BR", "municipality", Some(2011), None, 5570),
        ];
        let plan = plan_units(&entities, true).unwrap();
        let layout = layout();
        let records = ManifestBuilder::new(&layout, "https://cdn.example.org/regions/")
            .unwrap()
            .build(&entities, &plan);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.links.is_none());
        assert_eq!(record.regions_count, 10570);
        assert_eq!(record.year_start, 2000);
        assert_eq!(record.slices.len(), 2);
        assert_eq!(record.slices[0].year_end, Some(2010));
        assert_eq!(record.slices[1].year_end, None);
        assert_eq!(
            record.slices[1].links.url_topojson,
            "https://cdn.example.org/regions/br/municipality-2011-present.topo.json"
        );
    }

    #[test]
    fn test_rejected_groups_have_no_record() {
        let entities = vec![
            entity("BR", "state", Some(2000), Some(2005), 27),
            entity("BR", "state", Some(2010), Some(2020), 27),
            entity("AR", "province", None, None, 24),
        ];
        let plan = plan_units(&entities, true).unwrap();
        let layout = layout();
        let records = ManifestBuilder::new(&layout, "https://cdn.example.org/")
            .unwrap()
            .build(&entities, &plan);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].country_code, "AR");
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path(), "geojson", "topo.json");
        let entities = vec![entity("PY", "department", None, None, 17)];
        let plan = plan_units(&entities, false).unwrap();
        let records = ManifestBuilder::new(&layout, "https://cdn.example.org/")
            .unwrap()
            .build(&entities, &plan);

        let path = write_manifest(&layout, &records).unwrap();
        assert_eq!(path, dir.path().join("metadata.json"));
        assert_eq!(read_manifest(&path).unwrap(), records);
    }

    #[test]
    fn test_invalid_base_url() {
        let layout = layout();
        assert!(ManifestBuilder::new(&layout, "cdn without scheme").is_err());
    }
}
