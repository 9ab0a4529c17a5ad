//! End-to-end orchestration of an extraction run.
//!
//! A run reads the dictionary, plans units, extracts them on the worker pool
//! and, once every unit has a result, writes the manifest, combines each
//! level and reduces everything into an [`Outcome`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::aggregate::{FailureReport, Outcome, ResultAggregator};
use crate::combine::{LevelCombiner, LevelResult};
use crate::config::Config;
use crate::error::{ArtifactError, ConfigError, PipelineError};
use crate::extraction::{
    existing_fragment, plan_units, ArtifactLayout, ExtractionResult, ExtractionScheduler, UnitOutcome,
    UnitPlan,
};
use crate::manifest::{write_manifest, ManifestBuilder};
use crate::models::{Entity, ExtractionUnit, GroupKey, UnitKey};
use crate::store::{entities_from_rows, load_dictionary, RegionStore};
use crate::topology::{QuantizedTopology, TopologyEncoder};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub temporal_slicing: bool,
    pub tolerated: Vec<GroupKey>,
    pub base_url: String,
    pub show_progress: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            workers: config.extraction.workers,
            temporal_slicing: config.extraction.temporal_slicing,
            tolerated: config.extraction.tolerated_groups()?,
            base_url: config.output.base_url.clone(),
            show_progress: true,
        })
    }
}

/// Entities and units planned for one run.
pub struct RunPlan {
    pub entities: Vec<Entity>,
    pub units: UnitPlan,
}

/// Units from outside a restricted run that its composites still include.
#[derive(Default)]
struct Carried {
    entities: Vec<Entity>,
    units: Vec<ExtractionUnit>,
    results: Vec<ExtractionResult>,
}

pub struct Pipeline {
    store: Arc<dyn RegionStore>,
    layout: Arc<ArtifactLayout>,
    encoder: Arc<dyn TopologyEncoder>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(store: Arc<dyn RegionStore>, layout: ArtifactLayout, options: PipelineOptions) -> Self {
        Self {
            store,
            layout: Arc::new(layout),
            encoder: Arc::new(QuantizedTopology::default()),
            options,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn RegionStore>) -> Result<Self, ConfigError> {
        Ok(Self::new(
            store,
            ArtifactLayout::from_config(&config.output),
            PipelineOptions::from_config(config)?,
        ))
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn TopologyEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Load and validate the dictionary and expand it into units.
    pub async fn plan(&self, country_codes: &[String]) -> Result<RunPlan, PipelineError> {
        let rows = load_dictionary(self.store.as_ref(), country_codes).await?;
        let entities = entities_from_rows(&rows)?;
        let units = plan_units(&entities, self.options.temporal_slicing)?;
        Ok(RunPlan { entities, units })
    }

    /// Full run over `country_codes` (every country when empty).
    ///
    /// A run restricted to some countries still rewrites whole composites,
    /// so the other countries' fragments already on disk are folded back in.
    pub async fn run(&self, country_codes: &[String]) -> Result<Outcome, PipelineError> {
        let plan = self.plan(country_codes).await?;
        let levels = plan.units.levels();
        let results = self.extract(plan.units.units.clone()).await;
        let carried = self.carry_outside(country_codes, &levels).await;
        self.finish(&plan, carried, country_codes, results, levels).await
    }

    /// Re-run only what `report` lists.
    ///
    /// Units of the affected levels that are not re-run are taken from the
    /// fragments a previous run left on disk, so each affected level is
    /// recombined in full. A listed unit that no longer exists in the plan
    /// is skipped with a warning.
    pub async fn retry(&self, report: &FailureReport) -> Result<Outcome, PipelineError> {
        let plan = self.plan(&report.scope).await?;

        let listed_units: HashSet<&UnitKey> = report.units.iter().collect();
        let listed_groups: HashSet<&GroupKey> = report.groups.iter().collect();
        let (rerun, kept): (Vec<ExtractionUnit>, Vec<ExtractionUnit>) =
            plan.units.units.iter().cloned().partition(|unit| {
                listed_units.contains(&unit.key()) || listed_groups.contains(&unit.group)
            });

        let planned: HashSet<UnitKey> = plan.units.units.iter().map(ExtractionUnit::key).collect();
        for unit in report.units.iter().filter(|u| !planned.contains(*u)) {
            warn!("Unit {} is no longer planned, skipping", unit);
        }

        let planned_levels: BTreeSet<String> = plan.units.levels().into_iter().collect();
        let levels: BTreeSet<String> = rerun
            .iter()
            .map(|u| u.group.level.clone())
            .chain(report.levels.iter().cloned())
            .filter(|level| planned_levels.contains(level))
            .collect();
        let levels: Vec<String> = levels.into_iter().collect();

        info!(
            "Retrying {} units in {} (recombining {} levels)",
            rerun.len(),
            describe_countries(&report.countries()),
            levels.len()
        );

        let mut results = self.extract(rerun).await;
        results.extend(
            kept.iter()
                .filter(|unit| levels.iter().any(|level| level == unit.level()))
                .map(|unit| self.recover(unit)),
        );
        let carried = self.carry_outside(&report.scope, &levels).await;

        self.finish(&plan, carried, &report.scope, results, levels).await
    }

    async fn extract(&self, units: Vec<ExtractionUnit>) -> Vec<ExtractionResult> {
        ExtractionScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.layout),
            Arc::clone(&self.encoder),
            self.options.workers,
        )
        .with_progress(self.options.show_progress)
        .run(units)
        .await
    }

    /// Result for a unit that is not re-run, built from its fragment on disk.
    fn recover(&self, unit: &ExtractionUnit) -> ExtractionResult {
        let key = unit.key();
        match existing_fragment(&self.layout, &key) {
            Some(fragment) => ExtractionResult {
                unit: key,
                outcome: UnitOutcome::Produced(fragment),
            },
            None => ExtractionResult::failed(key, "fragment from previous run is missing"),
        }
    }

    /// Fragments on disk for units of `levels` outside `scope`.
    ///
    /// A unit without a fragment is left out rather than failed: its country
    /// was never asked for. Nothing is carried for an unrestricted run.
    async fn carry_outside(&self, scope: &[String], levels: &[String]) -> Carried {
        let mut carried = Carried::default();
        if scope.is_empty() || levels.is_empty() {
            return carried;
        }

        let full = match self.plan(&[]).await {
            Ok(full) => full,
            Err(e) => {
                warn!(
                    "Cannot plan countries outside {}, composites will hold only those: {}",
                    describe_countries(scope),
                    e
                );
                return carried;
            }
        };

        let in_scope = |country: &str| scope.iter().any(|cc| cc.eq_ignore_ascii_case(country));
        for unit in full.units.units {
            if in_scope(&unit.group.country) || !levels.iter().any(|level| level == unit.level()) {
                continue;
            }
            let key = unit.key();
            match existing_fragment(&self.layout, &key) {
                Some(fragment) => {
                    carried.results.push(ExtractionResult {
                        unit: key,
                        outcome: UnitOutcome::Produced(fragment),
                    });
                    carried.units.push(unit);
                }
                None => debug!("No fragment for {} outside the run's countries", key),
            }
        }
        carried.entities = full
            .entities
            .into_iter()
            .filter(|entity| !in_scope(&entity.group.country))
            .collect();

        if !carried.results.is_empty() {
            info!(
                "Carrying {} fragments from countries outside {}",
                carried.results.len(),
                describe_countries(scope)
            );
        }
        carried
    }

    /// Everything after the extraction barrier.
    async fn finish(
        &self,
        plan: &RunPlan,
        carried: Carried,
        scope: &[String],
        mut results: Vec<ExtractionResult>,
        levels: Vec<String>,
    ) -> Result<Outcome, PipelineError> {
        let mut entities = plan.entities.clone();
        entities.extend(carried.entities);
        let mut listed = UnitPlan {
            units: plan.units.units.clone(),
            ..Default::default()
        };
        listed.units.extend(carried.units);
        results.extend(carried.results);

        let records = ManifestBuilder::new(&self.layout, &self.options.base_url)?.build(&entities, &listed);
        let manifest = write_manifest(&self.layout, &records)?;
        info!("Wrote {} manifest records to {}", records.len(), manifest.display());

        let (level_results, results) = self.combine(levels, results).await?;

        let outcome = ResultAggregator::new(self.options.tolerated.clone()).aggregate(
            &plan.units.rejected,
            &results,
            &level_results,
        );
        self.persist_report(&outcome, scope)?;
        Ok(outcome)
    }

    async fn combine(
        &self,
        levels: Vec<String>,
        results: Vec<ExtractionResult>,
    ) -> Result<(Vec<LevelResult>, Vec<ExtractionResult>), PipelineError> {
        let combiner = LevelCombiner::new(Arc::clone(&self.layout), Arc::clone(&self.encoder));
        tokio::task::spawn_blocking(move || {
            let combined = combiner.combine_all(&levels, &results);
            (combined, results)
        })
        .await
        .map_err(|e| PipelineError::Aborted(format!("combine phase ({})", e)))
    }

    /// Write the failure report, or clear a stale one after a clean run.
    fn persist_report(&self, outcome: &Outcome, scope: &[String]) -> Result<(), ArtifactError> {
        let path = self.layout.failure_report_path();
        let mut report = outcome.failure_report();
        if report.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|source| ArtifactError::Io {
                    path: path.clone(),
                    source,
                })?;
                info!("Removed stale failure report {}", path.display());
            }
            return Ok(());
        }
        report.scope = scope.to_vec();
        report.save(&path)?;
        warn!("Wrote failure report to {}", path.display());
        Ok(())
    }
}

fn describe_countries(countries: &[String]) -> String {
    if countries.is_empty() {
        "no countries".to_string()
    } else {
        countries.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::artifacts::read_collection;
    use crate::manifest::read_manifest;
    use crate::models::{DictionaryRow, Validity, OPEN_END};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn row(cc: &str, name: &str, level: &str) -> DictionaryRow {
        DictionaryRow {
            country_name: name.to_string(),
            country_code: cc.to_string(),
            level: level.to_string(),
            level_name: None,
            parent_level: None,
            year_start: None,
            year_end: None,
            regions_count: 1,
        }
    }

    fn feature(id: &str, x: f64) -> serde_json::Value {
        json!({
            "type": "Feature",
            "id": id,
            "properties": { "name": id },
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[x, 0.0], [x + 1.0, 0.0], [x + 1.0, 1.0], [x, 0.0]]]
            }
        })
    }

    /// Three countries with a `state` level; Brazil also has `municipality`.
    fn store() -> MemoryStore {
        let all = Validity::new(1, OPEN_END);
        MemoryStore::new()
            .with_row(row("AR", "ARGENTINA", "state"))
            .with_row(row("BR", "BRAZIL", "state"))
            .with_row(row("BR", "BRAZIL", "municipality"))
            .with_row(row("PY", "PARAGUAY", "state"))
            .with_feature(GroupKey::new("AR", "state"), all, feature("AR-1", 0.0))
            .with_feature(GroupKey::new("BR", "state"), all, feature("BR-1", 2.0))
            .with_feature(GroupKey::new("BR", "municipality"), all, feature("BR-M-1", 2.0))
            .with_feature(GroupKey::new("PY", "state"), all, feature("PY-1", 4.0))
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            workers: 2,
            temporal_slicing: false,
            tolerated: Vec::new(),
            base_url: "https://cdn.example.org/regions".to_string(),
            show_progress: false,
        }
    }

    fn pipeline(store: &Arc<MemoryStore>, root: &std::path::Path) -> Pipeline {
        let store: Arc<dyn RegionStore> = Arc::clone(store) as Arc<dyn RegionStore>;
        Pipeline::new(store, ArtifactLayout::new(root, "geojson", "topo.json"), options())
    }

    fn composite_ids(layout: &ArtifactLayout, level: &str) -> Vec<String> {
        read_collection(&layout.composite_paths(level).geojson)
            .unwrap()
            .features
            .iter()
            .map(|f| f["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clean_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store());
        let pipeline = pipeline(&store, dir.path());

        let outcome = pipeline.run(&[]).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.units_total, 4);
        assert_eq!(outcome.levels_combined, 2);
        assert_eq!(composite_ids(pipeline.layout(), "state"), vec!["AR-1", "BR-1", "PY-1"]);
        assert!(dir.path().join("metadata.json").exists());
        assert!(dir.path().join("all/municipality.topo.json").exists());
        assert!(!dir.path().join("failures.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_failure_keeps_sibling_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store().failing(GroupKey::new("AR", "state"), 1));
        let pipeline = pipeline(&store, dir.path());

        let outcome = pipeline.run(&[]).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.failed_units.len(), 1);
        assert_eq!(outcome.failed_units[0].unit.country, "AR");
        assert!(outcome.failed_levels.is_empty());
        assert_eq!(composite_ids(pipeline.layout(), "state"), vec!["BR-1", "PY-1"]);

        let report = FailureReport::load(&dir.path().join("failures.json")).unwrap();
        assert_eq!(report.units.len(), 1);
        assert!(report.scope.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_level_without_fragments_fails_only_that_level() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store().failing(GroupKey::new("BR", "municipality"), 1));
        let pipeline = pipeline(&store, dir.path());

        let outcome = pipeline.run(&[]).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.failed_levels.len(), 1);
        assert_eq!(outcome.failed_levels[0].level, "municipality");
        assert_eq!(outcome.levels_combined, 1);
        assert!(dir.path().join("all/state.geojson").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_reruns_only_failed_units() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store().failing(GroupKey::new("AR", "state"), 1));
        let pipeline = pipeline(&store, dir.path());

        let first = pipeline.run(&[]).await.unwrap();
        assert!(!first.is_success());
        let fetched = store.fetch_count();
        assert_eq!(fetched, 4);

        let report = FailureReport::load(&dir.path().join("failures.json")).unwrap();
        let retried = pipeline.retry(&report).await.unwrap();
        assert!(retried.is_success());
        assert_eq!(store.fetch_count(), fetched + 1);
        assert_eq!(retried.units_total, 3);
        assert_eq!(composite_ids(pipeline.layout(), "state"), vec!["AR-1", "BR-1", "PY-1"]);
        assert!(!dir.path().join("failures.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_counts_missing_fragments_as_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store());
        let pipeline = pipeline(&store, dir.path());

        let report = FailureReport {
            units: vec![UnitKey {
                country: "AR".to_string(),
                level: "state".to_string(),
                slice: None,
            }],
            ..Default::default()
        };
        // Nothing was extracted before, so BR and PY have no fragments.
        let outcome = pipeline.retry(&report).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.units_succeeded, 1);
        assert_eq!(outcome.failed_units.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reruns_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store());
        let pipeline = pipeline(&store, dir.path());
        let composite = pipeline.layout().composite_paths("state");

        pipeline.run(&[]).await.unwrap();
        let first = (
            std::fs::read(&composite.geojson).unwrap(),
            std::fs::read(&composite.topojson).unwrap(),
        );
        pipeline.run(&[]).await.unwrap();
        let second = (
            std::fs::read(&composite.geojson).unwrap(),
            std::fs::read(&composite.topojson).unwrap(),
        );
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_country_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store());
        let pipeline = pipeline(&store, dir.path());

        let plan = pipeline.plan(&["br".to_string()]).await.unwrap();
        assert_eq!(plan.units.units.len(), 2);
        assert!(plan.units.units.iter().all(|u| u.group.country == "BR"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_country_run_keeps_other_countries_in_composites() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store());
        let pipeline = pipeline(&store, dir.path());

        pipeline.run(&[]).await.unwrap();
        assert_eq!(store.fetch_count(), 4);

        let outcome = pipeline.run(&["BR".to_string()]).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(store.fetch_count(), 6);
        assert_eq!(composite_ids(pipeline.layout(), "state"), vec!["AR-1", "BR-1", "PY-1"]);
        assert_eq!(composite_ids(pipeline.layout(), "municipality"), vec!["BR-M-1"]);

        let records = read_manifest(&pipeline.layout().manifest_path()).unwrap();
        assert_eq!(records.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_country_run_skips_absent_countries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store());
        let pipeline = pipeline(&store, dir.path());

        let outcome = pipeline.run(&["br".to_string()]).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.units_total, 2);
        assert_eq!(composite_ids(pipeline.layout(), "state"), vec!["BR-1"]);

        let records = read_manifest(&pipeline.layout().manifest_path()).unwrap();
        assert!(records.iter().all(|r| r.country_code == "BR"));
        assert!(!dir.path().join("failures.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sliced_run_lists_each_region_once() {
        let dir = tempfile::tempdir().unwrap();
        let group = GroupKey::new("BR", "state");
        let mut early = row("BR", "BRAZIL", "state");
        early.year_start = Some(2000);
        early.year_end = Some(2015);
        let mut late = row("BR", "BRAZIL", "state");
        late.year_start = Some(2010);
        late.year_end = Some(2020);
        let store = Arc::new(
            MemoryStore::new()
                .with_row(early)
                .with_row(late)
                .with_feature(group.clone(), Validity::new(2000, 2015), feature("A", 0.0))
                .with_feature(group, Validity::new(2010, 2020), feature("B", 2.0)),
        );
        let options = PipelineOptions {
            temporal_slicing: true,
            ..options()
        };
        let pipeline = Pipeline::new(
            Arc::clone(&store) as Arc<dyn RegionStore>,
            ArtifactLayout::new(dir.path(), "geojson", "topo.json"),
            options,
        );

        let outcome = pipeline.run(&[]).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.units_total, 3);
        assert!(dir.path().join("br/state-2010-2015.geojson").exists());
        assert_eq!(composite_ids(pipeline.layout(), "state"), vec!["A", "B"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tolerated_group_alone_in_level() {
        let dir = tempfile::tempdir().unwrap();
        let concession = GroupKey::new("ID", "wood-pulp-concession");
        let store = Arc::new(
            store()
                .with_row(row("ID", "INDONESIA", "wood-pulp-concession"))
                .failing(concession.clone(), 1),
        );
        let options = PipelineOptions {
            tolerated: vec![concession],
            ..options()
        };
        let pipeline = Pipeline::new(
            Arc::clone(&store) as Arc<dyn RegionStore>,
            ArtifactLayout::new(dir.path(), "geojson", "topo.json"),
            options,
        );

        let outcome = pipeline.run(&[]).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.tolerated_units.len(), 1);
        assert_eq!(outcome.tolerated_levels.len(), 1);
        assert_eq!(outcome.tolerated_levels[0].level, "wood-pulp-concession");
        assert!(outcome.failed_levels.is_empty());
        assert!(!dir.path().join("all/wood-pulp-concession.geojson").exists());
    }

    #[tokio::test]
    async fn test_malformed_dictionary_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = row("BR", "BRAZIL", "state");
        bad.regions_count = 0;
        let store = Arc::new(MemoryStore::new().with_row(bad));
        let pipeline = pipeline(&store, dir.path());

        let err = pipeline.run(&[]).await.err().unwrap();
        assert!(matches!(err, PipelineError::Store(_)));
        assert_eq!(store.fetch_count(), 0);
    }
}
