//! Merging of per-unit fragments into one composite per level.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::error::{ArtifactError, CombineError};
use crate::extraction::artifacts::{read_collection, write_collection, write_json};
use crate::extraction::{ArtifactLayout, ArtifactPaths, ExtractionResult, Fragment};
use crate::models::{FeatureCollection, UnitKey, DEFAULT_CRS};
use crate::topology::TopologyEncoder;

/// The union of every fragment produced for one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeArtifact {
    pub level: String,
    pub paths: ArtifactPaths,
    pub fragments: usize,
    pub features: usize,
    pub crs: String,
    /// xxh64 of the composite GeoJSON bytes
    pub digest: u64,
}

/// Outcome of combining one level.
#[derive(Debug)]
pub struct LevelResult {
    pub level: String,
    pub outcome: Result<CompositeArtifact, CombineError>,
}

impl LevelResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct LevelCombiner {
    layout: Arc<ArtifactLayout>,
    encoder: Arc<dyn TopologyEncoder>,
}

impl LevelCombiner {
    pub fn new(layout: Arc<ArtifactLayout>, encoder: Arc<dyn TopologyEncoder>) -> Self {
        Self { layout, encoder }
    }

    /// Combine every level in `levels`. Levels are independent and are
    /// processed in parallel; the returned list follows `levels`.
    pub fn combine_all(&self, levels: &[String], results: &[ExtractionResult]) -> Vec<LevelResult> {
        levels
            .par_iter()
            .map(|level| {
                let outcome = self.combine(level, results);
                match &outcome {
                    Ok(composite) => info!(
                        "Combined level {}: {} fragments, {} features, digest {:016x}",
                        level, composite.fragments, composite.features, composite.digest
                    ),
                    Err(e) => error!("Combining level {} failed: {}", level, e),
                }
                LevelResult {
                    level: level.clone(),
                    outcome,
                }
            })
            .collect()
    }

    /// Merge the successful fragments of `level`, whatever their country or
    /// slice. Fragments are concatenated in unit-key order, so the output
    /// does not depend on the order units completed in. A feature already
    /// taken from an earlier fragment is skipped.
    pub fn combine(&self, level: &str, results: &[ExtractionResult]) -> Result<CompositeArtifact, CombineError> {
        let mut fragments: Vec<(&UnitKey, &Fragment)> = results
            .iter()
            .filter(|r| r.level() == level)
            .filter_map(|r| r.fragment().map(|f| (&r.unit, f)))
            .collect();

        if fragments.is_empty() {
            return Err(CombineError::NoFragments {
                level: level.to_string(),
            });
        }
        fragments.sort_by(|a, b| a.0.cmp(b.0));
        info!("Combining level {} from {} fragments", level, fragments.len());

        let artifact_err = |source: ArtifactError| CombineError::Artifact {
            level: level.to_string(),
            source,
        };

        let mut merged: Option<FeatureCollection> = None;
        let mut expected_crs = String::new();
        let mut seen = HashSet::new();

        for (unit, fragment) in &fragments {
            let collection = read_collection(&fragment.paths.geojson).map_err(artifact_err)?;
            let crs = collection.crs_name();

            match &merged {
                None => {
                    expected_crs = crs;
                    merged = Some(FeatureCollection {
                        kind: collection.kind.clone(),
                        crs: collection.crs.clone(),
                        features: Vec::new(),
                    });
                }
                Some(_) if crs != expected_crs => {
                    return Err(CombineError::CrsMismatch {
                        level: level.to_string(),
                        expected: expected_crs,
                        found: crs,
                        unit: (*unit).clone(),
                    });
                }
                Some(_) => {}
            }
            // A region valid across several slices is in each slice's fragment.
            if let Some(acc) = merged.as_mut() {
                acc.features.extend(
                    collection
                        .features
                        .into_iter()
                        .filter(|feature| seen.insert(feature_identity(feature))),
                );
            }
        }

        let mut merged = merged.ok_or_else(|| CombineError::NoFragments {
            level: level.to_string(),
        })?;
        if expected_crs == DEFAULT_CRS {
            merged.crs = None;
        }

        let paths = self.layout.composite_paths(level);
        let digest = write_collection(&paths.geojson, &merged).map_err(artifact_err)?;
        let topology = self.encoder.encode(&merged).map_err(artifact_err)?;
        write_json(&paths.topojson, &topology).map_err(artifact_err)?;

        Ok(CompositeArtifact {
            level: level.to_string(),
            paths,
            fragments: fragments.len(),
            features: merged.len(),
            crs: expected_crs,
            digest,
        })
    }
}

/// Key a feature is deduplicated by: its `id`, or its full serialized form.
fn feature_identity(feature: &Value) -> String {
    match feature.get("id").filter(|id| !id.is_null()) {
        Some(id) => format!("id:{}", id),
        None => format!("raw:{}", feature),
    }
}
