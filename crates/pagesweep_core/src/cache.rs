use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::CacheError;

pub const DEFAULT_CACHE_DIR: &str = ".pagesweep/cache";

const RECORD_EXTENSION: &str = "json";

/// Directory of JSON records, one file per key. No expiry: callers pick keys
/// (for example `pages_<space>`) and bypass the cache when they need fresh data.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", record_file_stem(key)))
    }

    /// Returns the stored value, or `None` when no record exists for `key`.
    /// A record that exists but does not decode is [`CacheError::Corrupt`].
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let path = self.record_path(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|error| CacheError::Corrupt {
                path,
                message: error.to_string(),
            })
    }

    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|source| CacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.record_path(key);
        let rendered =
            serde_json::to_string_pretty(value).map_err(|error| CacheError::Serialize {
                key: key.to_string(),
                message: error.to_string(),
            })?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, rendered).map_err(|source| CacheError::Io {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &path).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })
    }

    /// With `use_cache`, a stored record wins and `compute` is not called.
    /// Otherwise `compute` runs and its value replaces whatever was stored.
    pub fn get_or_compute<T, F>(&self, key: &str, use_cache: bool, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if use_cache && let Some(value) = self.load(key)? {
            debug!(key, "cache hit");
            return Ok(value);
        }
        debug!(key, use_cache, "cache miss; computing");
        let value = compute()?;
        self.store(key, &value)?;
        Ok(value)
    }

    /// Returns `true` when a record was removed.
    pub fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Removes every record in the cache directory and returns how many were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut removed = 0usize;
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            fs::remove_file(&path).map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Readable prefix plus a digest suffix so that keys differing only in
/// characters that get sanitized still map to different files.
fn record_file_stem(key: &str) -> String {
    let mut readable = String::with_capacity(key.len());
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
            readable.push(ch);
        } else {
            readable.push('_');
        }
    }
    if readable.is_empty() {
        readable.push_str("record");
    }

    let digest = Sha256::digest(key.as_bytes());
    let mut suffix = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        suffix.push_str(&format!("{byte:02x}"));
    }
    format!("{readable}-{suffix}")
}
