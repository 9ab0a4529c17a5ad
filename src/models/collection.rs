//! Feature collection payloads.
//!
//! Features are kept as opaque JSON values. Only the collection envelope and
//! its spatial reference are inspected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Spatial reference assumed when a collection does not declare one.
pub const DEFAULT_CRS: &str = "EPSG:4326";

const FEATURE_COLLECTION: &str = "FeatureCollection";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<Value>,

    #[serde(default)]
    pub features: Vec<Value>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Value>) -> Self {
        Self {
            kind: FEATURE_COLLECTION.to_string(),
            crs: None,
            features,
        }
    }

    /// Interpret a raw JSON payload as a collection.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let collection: FeatureCollection =
            serde_json::from_value(value).map_err(|e| e.to_string())?;
        if collection.kind != FEATURE_COLLECTION {
            return Err(format!("expected {}, got {}", FEATURE_COLLECTION, collection.kind));
        }
        Ok(collection)
    }

    /// Normalized spatial reference name of this collection.
    pub fn crs_name(&self) -> String {
        let name = self
            .crs
            .as_ref()
            .and_then(|crs| crs.pointer("/properties/name"))
            .and_then(Value::as_str);

        match name {
            None => DEFAULT_CRS.to_string(),
            Some(name) => normalize_crs(name),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Map the common spellings of a CRS onto `EPSG:<code>`.
fn normalize_crs(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    if upper.ends_with("CRS84") {
        return DEFAULT_CRS.to_string();
    }
    // urn:ogc:def:crs:EPSG::4326
    if let Some(idx) = upper.find("EPSG") {
        let code: String = upper[idx + 4..]
            .trim_start_matches(':')
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !code.is_empty() {
            return format!("EPSG:{}", code);
        }
    }
    upper
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_crs_is_wgs84() {
        let fc = FeatureCollection::new(vec![]);
        assert_eq!(fc.crs_name(), DEFAULT_CRS);
    }

    #[test]
    fn test_crs_spellings_normalize() {
        for name in [
            "urn:ogc:def:crs:OGC:1.3:CRS84",
            "urn:ogc:def:crs:EPSG::4326",
            "epsg:4326",
        ] {
            let value = json!({
                "type": "FeatureCollection",
                "crs": { "type": "name", "properties": { "name": name } },
                "features": []
            });
            let fc = FeatureCollection::from_value(value).unwrap();
            assert_eq!(fc.crs_name(), "EPSG:4326", "{}", name);
        }
    }

    #[test]
    fn test_rejects_non_collection() {
        let value = json!({ "type": "Feature", "geometry": null });
        assert!(FeatureCollection::from_value(value).is_err());
    }

    #[test]
    fn test_null_features_default_to_empty() {
        let value = json!({ "type": "FeatureCollection" });
        let fc = FeatureCollection::from_value(value).unwrap();
        assert!(fc.is_empty());
    }
}
