use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CACHE_DIR;
use crate::error::ConfigError;
use crate::listing::DEFAULT_PAGE_SIZE;
use crate::review::DEFAULT_APPROVAL_LABEL;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SweepConfig {
    pub username: Option<String>,
    #[serde(alias = "api_token")]
    pub password: Option<String>,
    #[serde(alias = "base_url")]
    pub confluence_base_url: Option<String>,
    pub target_spaces: Vec<String>,
    pub dry_run: bool,
    /// `0` means unlimited.
    #[serde(alias = "limit")]
    pub update_limit: usize,
    pub use_cache: bool,
    pub page_size: usize,
    pub cache_dir: Option<PathBuf>,
    pub progress_every: usize,
    pub approval_label: Option<String>,
    pub pattern_file: Option<PathBuf>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            confluence_base_url: None,
            target_spaces: Vec::new(),
            dry_run: true,
            update_limit: 0,
            use_cache: true,
            page_size: DEFAULT_PAGE_SIZE,
            cache_dir: None,
            progress_every: DEFAULT_PROGRESS_EVERY,
            approval_label: None,
            pattern_file: None,
        }
    }
}

impl SweepConfig {
    /// Resolve the account name: env CONFLUENCE_USERNAME > config.
    pub fn username(&self) -> Option<String> {
        env_override("CONFLUENCE_USERNAME").or_else(|| self.username.clone())
    }

    /// Resolve the API token: env CONFLUENCE_API_TOKEN > config `password`.
    pub fn api_token(&self) -> Option<String> {
        env_override("CONFLUENCE_API_TOKEN").or_else(|| self.password.clone())
    }

    /// Resolve the site URL: env CONFLUENCE_BASE_URL > config, without trailing slash.
    pub fn base_url(&self) -> Option<String> {
        env_override("CONFLUENCE_BASE_URL")
            .or_else(|| self.confluence_base_url.clone())
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }

    pub fn credentials(&self) -> Result<(String, String)> {
        let username = self
            .username()
            .context("missing username (config `username` or CONFLUENCE_USERNAME)")?;
        let token = self
            .api_token()
            .context("missing API token (config `password` or CONFLUENCE_API_TOKEN)")?;
        Ok((username, token))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
    }

    pub fn approval_label(&self) -> &str {
        self.approval_label
            .as_deref()
            .unwrap_or(DEFAULT_APPROVAL_LABEL)
    }

    /// Settings that would make a run ambiguous are rejected, never coerced.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Ambiguous(
                "page_size must be greater than zero".to_string(),
            ));
        }
        if self.progress_every == 0 {
            return Err(ConfigError::Ambiguous(
                "progress_every must be greater than zero".to_string(),
            ));
        }
        if self.target_spaces.is_empty() {
            return Err(ConfigError::Ambiguous(
                "target_spaces is empty; name at least one space".to_string(),
            ));
        }
        if let Some(space) = self
            .target_spaces
            .iter()
            .find(|space| space.trim().is_empty() || space.trim() != space.as_str())
        {
            return Err(ConfigError::Ambiguous(format!(
                "space key {space:?} is blank or padded with whitespace"
            )));
        }
        if self.base_url().is_none() {
            return Err(ConfigError::Ambiguous(
                "confluence_base_url is not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load a config file (JSON, or TOML by extension). Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<SweepConfig> {
    if !config_path.exists() {
        return Ok(SweepConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let is_toml = config_path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let parsed: SweepConfig = if is_toml {
        toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    };
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
