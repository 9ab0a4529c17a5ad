//! Artifact naming and file output.
//!
//! Every path is derived from the unit identity alone, so concurrent writers
//! never target the same file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::config::OutputConfig;
use crate::error::ArtifactError;
use crate::models::{FeatureCollection, UnitKey};

/// Directory composites are written to, relative to the output root.
pub const COMPOSITE_DIR: &str = "all";

/// Paths of one artifact in both encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub geojson: PathBuf,
    pub topojson: PathBuf,
}

/// Output layout under a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    geojson_extension: String,
    topojson_extension: String,
}

impl ArtifactLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        geojson_extension: impl Into<String>,
        topojson_extension: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            geojson_extension: geojson_extension.into(),
            topojson_extension: topojson_extension.into(),
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(
            &config.root,
            &config.geojson_extension,
            &config.topojson_extension,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{cc}/{level}[-{tag}]`, relative to the root.
    pub fn fragment_stem(unit: &UnitKey) -> String {
        let mut stem = format!("{}/{}", unit.country.to_lowercase(), unit.level);
        if let Some(slice) = unit.slice {
            stem.push('-');
            stem.push_str(&slice.tag());
        }
        stem
    }

    pub fn composite_stem(level: &str) -> String {
        format!("{}/{}", COMPOSITE_DIR, level)
    }

    /// Relative paths, `/`-separated, as published.
    pub fn relative(&self, stem: &str) -> (String, String) {
        (
            format!("{}.{}", stem, self.geojson_extension),
            format!("{}.{}", stem, self.topojson_extension),
        )
    }

    pub fn fragment_paths(&self, unit: &UnitKey) -> ArtifactPaths {
        self.paths(&Self::fragment_stem(unit))
    }

    pub fn composite_paths(&self, level: &str) -> ArtifactPaths {
        self.paths(&Self::composite_stem(level))
    }

    fn paths(&self, stem: &str) -> ArtifactPaths {
        let (geojson, topojson) = self.relative(stem);
        ArtifactPaths {
            geojson: self.root.join(geojson),
            topojson: self.root.join(topojson),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    pub fn failure_report_path(&self) -> PathBuf {
        self.root.join("failures.json")
    }
}

/// Serialize `value` compactly to `path` and return the xxh64 digest of the
/// bytes written.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<u64, ArtifactError> {
    let bytes = serde_json::to_vec(value).map_err(|source| ArtifactError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    write_bytes(path, &bytes)?;
    Ok(xxh64(&bytes, 0))
}

/// Like [`write_json`] but indented, for files meant to be read by people.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| ArtifactError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    write_bytes(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let bytes = fs::read(path).map_err(|source| ArtifactError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_collection(path: &Path, collection: &FeatureCollection) -> Result<u64, ArtifactError> {
    write_json(path, collection)
}

pub fn read_collection(path: &Path) -> Result<FeatureCollection, ArtifactError> {
    read_json(path)
}

/// Write through a temporary sibling and rename, so a file that exists is
/// always complete.
fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Validity, OPEN_END};

    fn layout() -> ArtifactLayout {
        ArtifactLayout::new("data", "geojson", "topo.json")
    }

    #[test]
    fn test_fragment_naming() {
        let unit = UnitKey {
            country: "BR".to_string(),
            level: "municipality".to_string(),
            slice: None,
        };
        let paths = layout().fragment_paths(&unit);
        assert_eq!(paths.geojson, PathBuf::from("data/br/municipality.geojson"));
        assert_eq!(paths.topojson, PathBuf::from("data/br/municipality.topo.json"));
    }

    #[test]
    fn test_sliced_fragments_do_not_collide() {
        let key = |start, end| UnitKey {
            country: "ID".to_string(),
            level: "wood-pulp-concession".to_string(),
            slice: Some(Validity::new(start, end)),
        };
        let a = layout().fragment_paths(&key(2015, 2019));
        let b = layout().fragment_paths(&key(2020, OPEN_END));
        assert_eq!(
            a.geojson,
            PathBuf::from("data/id/wood-pulp-concession-2015-2019.geojson")
        );
        assert_eq!(
            b.geojson,
            PathBuf::from("data/id/wood-pulp-concession-2020-present.geojson")
        );
    }

    #[test]
    fn test_composite_naming() {
        let paths = layout().composite_paths("state");
        assert_eq!(paths.geojson, PathBuf::from("data/all/state.geojson"));
        assert_eq!(paths.topojson, PathBuf::from("data/all/state.topo.json"));
    }

    #[test]
    fn test_write_then_read_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("br/state.geojson");
        let fc = FeatureCollection::new(vec![serde_json::json!({"type": "Feature"})]);

        let digest = write_collection(&path, &fc).unwrap();
        assert_eq!(read_collection(&path).unwrap(), fc);
        assert_eq!(digest, write_collection(&path, &fc).unwrap());
        assert!(!dir.path().join("br/state.geojson.partial").exists());
    }
}
