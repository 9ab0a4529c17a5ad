//! PostgreSQL/PostGIS backed region store.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};

use super::RegionStore;
use crate::error::StoreError;
use crate::models::{DictionaryRow, FeatureCollection, FetchSelector};

const DICTIONARY_QUERY: &str = r#"
    SELECT
        country AS country_name,
        LEFT(trase_id, 2) AS country_code,
        node_type_slug AS level,
        node_type_name AS level_name,
        parent_node_type_slug AS parent_level,
        year_start,
        year_end,
        COUNT(1) AS regions_count
    FROM website.regions
    WHERE _geometry IS NOT NULL
      AND node_type_slug IS NOT NULL
    GROUP BY 1, 2, 3, 4, 5, 6, 7
    ORDER BY 1, 2, 3, 4, 5, 6, 7
"#;

// $1 country name, $2 level, $3/$4 slice start/end, $5 simplify tolerance,
// $6 coordinate precision
const COLLECTION_QUERY: &str = r#"
    WITH base AS (
        SELECT
            name,
            trase_id,
            biome,
            node_type_name,
            node_type_slug,
            country,
            year_start,
            year_end,
            COALESCE(year_start, 1) AS valid_from,
            COALESCE(year_end, 2147483647) AS valid_to,
            _geometry AS geometry
        FROM website.regions
        WHERE _geometry IS NOT NULL
          AND node_type_slug IS NOT NULL
    )
    SELECT json_build_object(
        'type', 'FeatureCollection',
        'features', COALESCE(json_agg(t.feature ORDER BY t.trase_id), '[]'::json)
    )::text AS data
    FROM (
        SELECT
            r.trase_id,
            jsonb_build_object(
                'type', 'Feature',
                'id', r.trase_id,
                'properties', to_jsonb(r.*) - 'geometry' - 'valid_from' - 'valid_to',
                'geometry', ST_AsGeoJSON(
                    ST_Simplify(ST_GeomFromGeoJSON(r.geometry), $5), $6
                )::jsonb
            ) AS feature
        FROM base r
        WHERE r.country = $1
          AND r.node_type_slug = $2
          AND r.valid_from <= $3
          AND r.valid_to >= $4
    ) t
"#;

#[derive(Debug, FromRow)]
struct DictionaryRecord {
    country_name: Option<String>,
    country_code: Option<String>,
    level: Option<String>,
    level_name: Option<String>,
    parent_level: Option<String>,
    year_start: Option<i32>,
    year_end: Option<i32>,
    regions_count: i64,
}

impl TryFrom<DictionaryRecord> for DictionaryRow {
    type Error = StoreError;

    fn try_from(record: DictionaryRecord) -> Result<Self, Self::Error> {
        let missing = |field: &str| StoreError::MalformedRow {
            reason: format!("missing {}", field),
        };
        Ok(DictionaryRow {
            country_name: record.country_name.ok_or_else(|| missing("country_name"))?,
            country_code: record.country_code.ok_or_else(|| missing("country_code"))?,
            level: record.level.ok_or_else(|| missing("level"))?,
            level_name: record.level_name,
            parent_level: record.parent_level,
            year_start: record.year_start,
            year_end: record.year_end,
            regions_count: record.regions_count,
        })
    }
}

/// Region store reading from the `website.regions` table.
#[derive(Clone)]
pub struct PgRegionStore {
    pool: PgPool,
    simplify_degrees: f64,
    coordinate_precision: i32,
}

impl PgRegionStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        simplify_degrees: f64,
        coordinate_precision: u32,
    ) -> Result<Self, StoreError> {
        info!("Connecting to region store...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self::from_pool(pool, simplify_degrees, coordinate_precision))
    }

    pub fn from_pool(pool: PgPool, simplify_degrees: f64, coordinate_precision: u32) -> Self {
        Self {
            pool,
            simplify_degrees,
            coordinate_precision: coordinate_precision.min(15) as i32,
        }
    }
}

#[async_trait]
impl RegionStore for PgRegionStore {
    async fn dictionary(&self) -> Result<Vec<DictionaryRow>, StoreError> {
        let records: Vec<DictionaryRecord> = sqlx::query_as(DICTIONARY_QUERY)
            .fetch_all(&self.pool)
            .await?;

        records.into_iter().map(DictionaryRow::try_from).collect()
    }

    async fn fetch_collection(
        &self,
        selector: &FetchSelector,
    ) -> Result<FeatureCollection, StoreError> {
        // Without a slice every validity range matches.
        let (start, end) = selector
            .years
            .map(|y| (y.start, y.end))
            .unwrap_or((i32::MAX, i32::MIN));

        debug!("Fetching {}", selector);
        let data: Option<String> = sqlx::query_scalar(COLLECTION_QUERY)
            .bind(&selector.country_name)
            .bind(&selector.level)
            .bind(start)
            .bind(end)
            .bind(self.simplify_degrees)
            .bind(self.coordinate_precision)
            .fetch_one(&self.pool)
            .await?;

        let malformed = |reason: String| StoreError::MalformedPayload {
            selector: selector.to_string(),
            reason,
        };

        let data = data.ok_or_else(|| malformed("query returned NULL".to_string()))?;
        let value: serde_json::Value =
            serde_json::from_str(&data).map_err(|e| malformed(e.to_string()))?;
        FeatureCollection::from_value(value).map_err(malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_missing_level_is_malformed() {
        let record = DictionaryRecord {
            country_name: Some("BRAZIL".to_string()),
            country_code: Some("BR".to_string()),
            level: None,
            level_name: None,
            parent_level: None,
            year_start: None,
            year_end: None,
            regions_count: 10,
        };
        let err = DictionaryRow::try_from(record).unwrap_err();
        assert!(matches!(err, StoreError::MalformedRow { .. }));
    }

    #[test]
    fn test_properties_keep_nullable_years() {
        assert!(COLLECTION_QUERY.contains("to_jsonb(r.*) - 'geometry' - 'valid_from' - 'valid_to'"));
        assert!(COLLECTION_QUERY.contains("r.valid_from <= $3"));
        assert!(COLLECTION_QUERY.contains("r.valid_to >= $4"));
        assert!(!COLLECTION_QUERY.contains("AS year_start"));
        assert!(!COLLECTION_QUERY.contains("AS year_end"));
    }
}
