//! In-memory region store for tests and dry runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::RegionStore;
use crate::error::StoreError;
use crate::models::{DictionaryRow, FeatureCollection, FetchSelector, GroupKey, Validity};

/// Region store backed by fixed rows and features.
///
/// Failures can be injected per group to exercise partial-failure paths.
#[derive(Default)]
pub struct MemoryStore {
    rows: Vec<DictionaryRow>,
    features: HashMap<GroupKey, Vec<(Validity, Value)>>,
    crs: HashMap<GroupKey, Value>,
    failures: Mutex<HashMap<GroupKey, usize>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row(mut self, row: DictionaryRow) -> Self {
        self.rows.push(row);
        self
    }

    /// Add a feature to `group`, valid over `validity`.
    pub fn with_feature(mut self, group: GroupKey, validity: Validity, feature: Value) -> Self {
        self.features.entry(group).or_default().push((validity, feature));
        self
    }

    /// Declare a non-default spatial reference for a group's collections.
    pub fn with_crs(mut self, group: GroupKey, crs: Value) -> Self {
        self.crs.insert(group, crs);
        self
    }

    /// Make the next `times` fetches for `group` fail.
    pub fn failing(self, group: GroupKey, times: usize) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(group, times);
        }
        self
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of geometry fetches served so far, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn take_failure(&self, group: &GroupKey) -> bool {
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        match failures.get_mut(group) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RegionStore for MemoryStore {
    async fn dictionary(&self) -> Result<Vec<DictionaryRow>, StoreError> {
        Ok(self.rows.clone())
    }

    async fn fetch_collection(
        &self,
        selector: &FetchSelector,
    ) -> Result<FeatureCollection, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let group = GroupKey::new(&selector.country_code, &selector.level);
        if self.take_failure(&group) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for {}",
                selector
            )));
        }

        let features = self
            .features
            .get(&group)
            .map(|features| {
                features
                    .iter()
                    .filter(|(validity, _)| match selector.years {
                        Some(years) => validity.contains(&years),
                        None => true,
                    })
                    .map(|(_, feature)| feature.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut collection = FeatureCollection::new(features);
        collection.crs = self.crs.get(&group).cloned();
        Ok(collection)
    }
}
