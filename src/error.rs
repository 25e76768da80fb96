//! Error types for the variable resolution and panel load engine.

use crate::types::IdentityKey;
use thiserror::Error;

/// Dependency-graph construction errors.
///
/// A cycle is a fatal configuration error surfaced before any load begins;
/// it is never retried.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cyclic variable dependency: {}", path.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(" -> "))]
    CyclicDependency { path: Vec<IdentityKey> },
}

/// VariableStore errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Variable instance not found: {0}")]
    InstanceNotFound(IdentityKey),

    #[error("Duplicate variable instance: {0}")]
    DuplicateInstance(IdentityKey),
}

/// Resolution-engine errors.
///
/// A failed resolution is isolated to the failing instance and its
/// descendants; siblings are unaffected.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Resolution failed for {key}: {message}")]
    ResolutionFailed { key: IdentityKey, message: String },
}

/// Panel orchestrator errors.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Invalid query: {0}")]
    Validation(String),

    /// Not a true failure: distinguished from errors everywhere it is
    /// observed, flagged via the partial-data markers, never surfaced as
    /// an error message.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Configuration loading and logging setup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Local cache store errors. The store itself logs and swallows backing
/// failures; this type exists for internal plumbing and tests.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    IoError(String),

    #[error("Cache codec error: {0}")]
    CodecError(String),
}

impl From<sled::Error> for CacheError {
    fn from(err: sled::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::CodecError(err.to_string())
    }
}
