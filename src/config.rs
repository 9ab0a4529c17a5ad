use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::models::GroupKey;

/// Environment variable that overrides `database.url`.
pub const DATABASE_URL_ENV: &str = "REGIONSLICE_DATABASE_URL";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub database: DatabaseConfig,
    pub extraction: ExtractionConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory all artifacts are written under
    pub root: PathBuf,
    pub geojson_extension: String,
    pub topojson_extension: String,
    /// Public URL the output root is published at, used in the manifest
    pub base_url: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            geojson_extension: "geojson".to_string(),
            topojson_extension: "topo.json".to_string(),
            base_url: "https://resources.example.org/data/regions".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Upper bound on concurrently running units
    pub workers: usize,
    /// Produce one unit per (group, slice) instead of one per group
    pub temporal_slicing: bool,
    /// Tolerance, in degrees, the store simplifies geometry by
    pub simplify_degrees: f64,
    /// Decimal digits kept in coordinates returned by the store
    pub coordinate_precision: u32,
    /// Groups whose unit failures do not fail the run
    pub tolerate: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            temporal_slicing: false,
            simplify_degrees: 0.003,
            coordinate_precision: 4,
            tolerate: Vec::new(),
        }
    }
}

impl ExtractionConfig {
    pub fn tolerated_groups(&self) -> Result<Vec<GroupKey>, ConfigError> {
        self.tolerate
            .iter()
            .map(|s| s.parse::<GroupKey>().map_err(ConfigError::Invalid))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub discord_webhook: Option<String>,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extraction.workers == 0 {
            return Err(ConfigError::Invalid(
                "extraction.workers must be at least 1".to_string(),
            ));
        }
        if self.output.geojson_extension == self.output.topojson_extension {
            return Err(ConfigError::Invalid(
                "geojson and topojson extensions must differ".to_string(),
            ));
        }
        url::Url::parse(&self.output.base_url).map_err(|e| {
            ConfigError::Invalid(format!("output.base_url {:?}: {}", self.output.base_url, e))
        })?;
        self.extraction.tolerated_groups()?;
        Ok(())
    }

    /// Database URL, with the environment taking precedence over the file.
    pub fn database_url(&self) -> Option<String> {
        std::env::var(DATABASE_URL_ENV)
            .ok()
            .or_else(|| self.database.url.clone())
    }
}
