//! Adapter lifecycle errors

use thiserror::Error;

/// Errors raised by injection, adapter switching, merging and persistence
#[derive(Error, Debug)]
pub enum PeftError {
    // Configuration
    #[error("Target modules {patterns} not found in the base model")]
    NoTargetMatched { patterns: String },

    #[error("Layer '{path}' of kind {kind} is not supported by {method}")]
    UnsupportedLayer { path: String, kind: &'static str, method: &'static str },

    #[error("Rank mismatch: {0}")]
    RankMismatch(String),

    #[error("Invalid adapter config: {0}")]
    InvalidConfig(String),

    #[error("Adapter method mismatch: model uses {expected}, got {actual}")]
    MethodMismatch { expected: String, actual: String },

    // State
    #[error("Adapter '{0}' is already merged")]
    AlreadyMerged(String),

    #[error("Nothing is merged, the adapter layers are already unmerged")]
    NothingMerged,

    #[error("Adapter '{0}' is merged; unmerge it first")]
    AdapterMerged(String),

    #[error("Adapter '{0}' does not exist")]
    UnknownAdapter(String),

    #[error("Adapter '{0}' already exists")]
    DuplicateAdapter(String),

    #[error("Adapter layers are already disabled")]
    AdaptersAlreadyDisabled,

    #[error("Adapter layers are disabled")]
    AdaptersDisabled,

    // I/O
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Missing tensor '{0}' in adapter weights")]
    MissingTensor(String),

    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch { name: String, expected: Vec<usize>, actual: Vec<usize> },
}

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, PeftError>;
