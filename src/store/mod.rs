//! Query interface to the relational store holding region geometries.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgRegionStore;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::{DictionaryRow, Entity, FeatureCollection, FetchSelector};

/// Read-only access to region metadata and geometry.
#[async_trait]
pub trait RegionStore: Send + Sync {
    /// Enumerate every `(country, level, validity)` cohort that has geometry.
    async fn dictionary(&self) -> Result<Vec<DictionaryRow>, StoreError>;

    /// Fetch the geometry of every region matching `selector` as one
    /// collection.
    async fn fetch_collection(&self, selector: &FetchSelector)
        -> Result<FeatureCollection, StoreError>;
}

/// Dictionary rows restricted to `country_codes` (all rows when empty).
pub async fn load_dictionary(
    store: &dyn RegionStore,
    country_codes: &[String],
) -> Result<Vec<DictionaryRow>, StoreError> {
    let rows = store.dictionary().await?;
    let total = rows.len();
    let rows: Vec<DictionaryRow> = if country_codes.is_empty() {
        rows
    } else {
        rows.into_iter()
            .filter(|row| {
                country_codes
                    .iter()
                    .any(|cc| cc.eq_ignore_ascii_case(&row.country_code))
            })
            .collect()
    };
    info!("Dictionary: {} rows ({} after filter)", total, rows.len());
    Ok(rows)
}

/// Validate dictionary rows into entities.
///
/// Every malformed row is logged; if any row is malformed the whole set is
/// rejected so that partitioning never sees partial groups.
pub fn entities_from_rows(rows: &[DictionaryRow]) -> Result<Vec<Entity>, StoreError> {
    let mut entities = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();

    for row in rows {
        match row.clone().into_entity() {
            Ok(entity) => entities.push(entity),
            Err(e) => {
                warn!("Rejecting dictionary row: {}", e);
                rejected.push(e.to_string());
            }
        }
    }

    if !rejected.is_empty() {
        return Err(StoreError::MalformedRow {
            reason: format!("{} row(s) rejected: {}", rejected.len(), rejected.join("; ")),
        });
    }
    Ok(entities)
}
