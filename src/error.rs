//! Typed errors for the verification pipeline.
//!
//! Oracle unreliability never shows up here: failed model calls surface as
//! `None` results and are handled by the stage retry policies.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FactError {
    /// Ragged structures that must line up do not.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A stage tried to write a field an earlier run already produced.
    #[error("field `{field}` already written for sample {sample}")]
    AlreadyWritten { field: String, sample: usize },

    #[error("retrieval from `{source_name}` failed: {source}")]
    Retrieval {
        source_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("unknown retrieval source: {0}")]
    UnknownSource(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FactError {
    pub fn retrieval(source_name: &str, err: anyhow::Error) -> Self {
        Self::Retrieval {
            source_name: source_name.to_string(),
            source: err.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FactError>;
