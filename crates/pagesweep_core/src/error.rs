use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by a [`crate::store::ContentStore`].
///
/// Batch stages match on these to decide between "skip", "log and continue"
/// and "abort the page".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("version conflict on {resource}: submitted version {submitted}")]
    VersionConflict { resource: String, submitted: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },
}

impl StoreError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>, submitted: u64) -> Self {
        Self::VersionConflict {
            resource: resource.into(),
            submitted,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache record {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("cannot serialize cache record {key}: {message}")]
    Serialize { key: String, message: String },

    #[error("cache io failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ambiguous configuration: {0}")]
    Ambiguous(String),
}
