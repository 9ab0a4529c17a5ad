//! Typed errors for the extraction core.
//!
//! Partition and resolution errors are fatal for their scope and unwind the
//! planning phase. Extraction errors are soft: the scheduler turns them into
//! per-unit failure results. Combine errors are fatal for one level only.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::{GroupKey, Slice, UnitKey};

/// A validity range that cannot be partitioned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("entity {id} in {group} has start {start} after end {end}")]
    InvertedRange {
        id: String,
        group: GroupKey,
        start: i32,
        end: i32,
    },
}

/// A computed slice has no active entities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("empty slice {slice}: no entity of {group} is active over it")]
    EmptySlice { group: GroupKey, slice: Slice },
}

/// Failures of the relational store or of the rows/payloads it returns.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("malformed dictionary row: {reason}")]
    MalformedRow { reason: String },

    #[error("malformed payload for {selector}: {reason}")]
    MalformedPayload { selector: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures while writing fragment or composite files.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build topology: {0}")]
    Topology(String),
}

/// A single unit failed. Always soft.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("task for {unit} aborted: {reason}")]
    Aborted { unit: UnitKey, reason: String },
}

/// A level could not be combined. Fatal for that level.
#[derive(Debug, Error)]
pub enum CombineError {
    #[error("no fragments available for level {level}")]
    NoFragments { level: String },

    #[error("level {level} mixes spatial references {expected} and {found} ({unit})")]
    CrsMismatch {
        level: String,
        expected: String,
        found: String,
        unit: UnitKey,
    },

    #[error("artifact error while combining {level}: {source}")]
    Artifact {
        level: String,
        #[source]
        source: ArtifactError,
    },
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A run notification could not be delivered. Never affects the outcome.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook rejected notification ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// A run could not be carried out at all.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} was aborted")]
    Aborted(String),
}

/// Publishing the output tree failed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no settings for environment {0} in secrets file")]
    MissingEnvironment(String),

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: String },
}
