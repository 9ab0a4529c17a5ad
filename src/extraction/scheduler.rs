//! Bounded-parallel execution of extraction units.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::artifacts::{write_collection, write_json, ArtifactLayout, ArtifactPaths};
use crate::error::{ArtifactError, ExtractError, StoreError};
use crate::models::{ExtractionUnit, UnitKey};
use crate::store::RegionStore;
use crate::topology::TopologyEncoder;

/// A fragment written by one successful unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub paths: ArtifactPaths,
    pub features: usize,
    pub crs: String,
    /// xxh64 of the fragment's GeoJSON bytes
    pub digest: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Produced(Fragment),
    Failed { cause: String },
}

/// Result of one unit. Never modified after the scheduler records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub unit: UnitKey,
    pub outcome: UnitOutcome,
}

impl ExtractionResult {
    pub fn failed(unit: UnitKey, cause: impl Into<String>) -> Self {
        Self {
            unit,
            outcome: UnitOutcome::Failed {
                cause: cause.into(),
            },
        }
    }

    pub fn level(&self) -> &str {
        &self.unit.level
    }

    pub fn fragment(&self) -> Option<&Fragment> {
        match &self.outcome {
            UnitOutcome::Produced(fragment) => Some(fragment),
            UnitOutcome::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Produced(_))
    }
}

/// Runs units on a fixed number of concurrent workers.
///
/// A failing unit produces a failure result and never affects its siblings.
/// `run` returns once every submitted unit has a result.
pub struct ExtractionScheduler {
    store: Arc<dyn RegionStore>,
    layout: Arc<ArtifactLayout>,
    encoder: Arc<dyn TopologyEncoder>,
    workers: usize,
    show_progress: bool,
}

impl ExtractionScheduler {
    pub fn new(
        store: Arc<dyn RegionStore>,
        layout: Arc<ArtifactLayout>,
        encoder: Arc<dyn TopologyEncoder>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            layout,
            encoder,
            workers: workers.max(1),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub async fn run(&self, units: Vec<ExtractionUnit>) -> Vec<ExtractionResult> {
        info!(
            "Extracting {} units with {} workers",
            units.len(),
            self.workers
        );

        let pb = self.progress_bar(units.len() as u64);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let submitted: Vec<UnitKey> = units.iter().map(ExtractionUnit::key).collect();
        let mut join_set = JoinSet::new();

        for unit in units {
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let layout = Arc::clone(&self.layout);
            let encoder = Arc::clone(&self.encoder);

            join_set.spawn(async move {
                let key = unit.key();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return ExtractionResult::failed(key, e.to_string()),
                };

                debug!("Starting unit {}", key);
                let task = extract_unit(store, layout, encoder, unit);
                let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(fragment)) => {
                        info!("{}: wrote {} features", key, fragment.features);
                        UnitOutcome::Produced(fragment)
                    }
                    Ok(Err(e)) => {
                        warn!("{}: {}", key, e);
                        UnitOutcome::Failed {
                            cause: e.to_string(),
                        }
                    }
                    Err(_) => {
                        error!("{}: task panicked", key);
                        UnitOutcome::Failed {
                            cause: "task panicked".to_string(),
                        }
                    }
                };
                ExtractionResult { unit: key, outcome }
            });
        }

        let mut results = Vec::with_capacity(submitted.len());
        while let Some(joined) = join_set.join_next().await {
            pb.inc(1);
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Extraction task join error: {}", e),
            }
        }
        pb.finish_and_clear();

        // A task lost to the runtime still owes its unit a result.
        let seen: HashSet<UnitKey> = results.iter().map(|r| r.unit.clone()).collect();
        for key in submitted {
            if !seen.contains(&key) {
                let cause = ExtractError::Aborted {
                    unit: key.clone(),
                    reason: "task did not complete".to_string(),
                };
                results.push(ExtractionResult::failed(key, cause.to_string()));
            }
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            "Extraction finished: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );
        results
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stdout());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

/// Fetch one unit's geometry and write its fragment in both encodings.
async fn extract_unit(
    store: Arc<dyn RegionStore>,
    layout: Arc<ArtifactLayout>,
    encoder: Arc<dyn TopologyEncoder>,
    unit: ExtractionUnit,
) -> Result<Fragment, ExtractError> {
    let selector = unit.selector();
    let collection = store.fetch_collection(&selector).await?;
    if collection.is_empty() {
        return Err(StoreError::MalformedPayload {
            selector: selector.to_string(),
            reason: "no features".to_string(),
        }
        .into());
    }

    let paths = layout.fragment_paths(&unit.key());
    let write_paths = paths.clone();

    // Encoding and file output are blocking work.
    let written = tokio::task::spawn_blocking(move || -> Result<(u64, usize, String), ArtifactError> {
        let digest = write_collection(&write_paths.geojson, &collection)?;
        let topology = encoder.encode(&collection)?;
        write_json(&write_paths.topojson, &topology)?;
        Ok((digest, collection.len(), collection.crs_name()))
    })
    .await
    .map_err(|e| ExtractError::Aborted {
        unit: unit.key(),
        reason: e.to_string(),
    })?;

    let (digest, features, crs) = written?;
    Ok(Fragment {
        paths,
        features,
        crs,
        digest,
    })
}

/// Rebuild a fragment description from files a previous run left behind.
pub fn existing_fragment(layout: &ArtifactLayout, unit: &UnitKey) -> Option<Fragment> {
    let paths = layout.fragment_paths(unit);
    if !paths.topojson.exists() {
        return None;
    }
    let bytes = std::fs::read(&paths.geojson).ok()?;
    let collection: crate::models::FeatureCollection = serde_json::from_slice(&bytes).ok()?;
    Some(Fragment {
        features: collection.len(),
        crs: collection.crs_name(),
        digest: xxhash_rust::xxh64::xxh64(&bytes, 0),
        paths,
    })
}
