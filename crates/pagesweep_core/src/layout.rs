use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::report::{PageFailure, PageLink, SpaceScope};
use crate::store::{ContentStore, PageSummary};

pub const LAYOUT_PUBLISHED_KEY: &str = "content-appearance-published";
pub const LAYOUT_DRAFT_KEY: &str = "content-appearance-draft";
pub const FULL_WIDTH: &str = "full-width";

const LAYOUT_KEYS: [&str; 2] = [LAYOUT_PUBLISHED_KEY, LAYOUT_DRAFT_KEY];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidenStatus {
    /// No layout property needed a correction.
    Conforming,
    /// The page carries no properties at all.
    NoProperties,
    WouldWiden,
    Widened,
    /// Every correction attempted on the page failed.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WidenOutcome {
    pub status: WidenStatus,
    pub corrected_keys: Vec<String>,
    pub failed_keys: Vec<KeyFailure>,
}

impl WidenOutcome {
    fn with_status(status: WidenStatus) -> Self {
        Self {
            status,
            corrected_keys: Vec::new(),
            failed_keys: Vec::new(),
        }
    }
}

/// Forces the published and draft layout properties of one page to
/// `full-width`. Property write failures are logged per key and do not stop
/// the remaining key; a property listing failure other than "not found" is
/// returned to the caller.
pub fn widen_page<S: ContentStore>(
    store: &mut S,
    page_id: &str,
    dry_run: bool,
) -> Result<WidenOutcome> {
    let properties = match store.get_properties(page_id) {
        Ok(properties) => properties,
        Err(StoreError::NotFound { .. }) => {
            return Ok(WidenOutcome::with_status(WidenStatus::NoProperties));
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read properties of {page_id}"));
        }
    };

    let pending = properties
        .into_iter()
        .filter(|property| LAYOUT_KEYS.contains(&property.key.as_str()))
        .filter(|property| property.value.as_str() != Some(FULL_WIDTH))
        .collect::<Vec<_>>();
    if pending.is_empty() {
        return Ok(WidenOutcome::with_status(WidenStatus::Conforming));
    }

    if dry_run {
        let mut outcome = WidenOutcome::with_status(WidenStatus::WouldWiden);
        outcome.corrected_keys = pending.into_iter().map(|property| property.key).collect();
        return Ok(outcome);
    }

    let mut outcome = WidenOutcome::with_status(WidenStatus::Failed);
    let full_width = Value::String(FULL_WIDTH.to_string());
    for property in pending {
        let written = store.put_property(
            page_id,
            &property.property_id,
            &property.key,
            &full_width,
            property.version + 1,
        );
        match written {
            Ok(()) => outcome.corrected_keys.push(property.key),
            Err(error) => {
                warn!(page = page_id, key = %property.key, "property write failed: {error}");
                outcome.failed_keys.push(KeyFailure {
                    key: property.key,
                    message: error.to_string(),
                });
            }
        }
    }
    if !outcome.corrected_keys.is_empty() {
        outcome.status = WidenStatus::Widened;
    }
    Ok(outcome)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WidenReport {
    pub dry_run: bool,
    pub checked: usize,
    pub widened: Vec<PageLink>,
    pub would_widen: Vec<PageLink>,
    pub without_properties: usize,
    pub property_failures: Vec<PageFailure>,
    pub errors: Vec<PageFailure>,
}

pub fn widen_pages<S: ContentStore>(
    store: &mut S,
    pages: &[PageSummary],
    scope: &SpaceScope,
    dry_run: bool,
) -> Result<WidenReport> {
    let mut report = WidenReport {
        dry_run,
        ..WidenReport::default()
    };
    let mut visited = HashSet::new();

    for (index, summary) in pages.iter().enumerate() {
        scope.progress("widen", index, pages.len());
        if !visited.insert(summary.id.as_str()) {
            continue;
        }
        report.checked += 1;
        let link = scope.link(&summary.id, &summary.title);

        let outcome = match widen_page(store, &summary.id, dry_run) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(page = %summary.title, "skipping page: {error:#}");
                report.errors.push(PageFailure {
                    page: link,
                    message: format!("{error:#}"),
                });
                continue;
            }
        };

        for failure in &outcome.failed_keys {
            report.property_failures.push(PageFailure {
                page: link.clone(),
                message: format!("{}: {}", failure.key, failure.message),
            });
        }
        match outcome.status {
            WidenStatus::Widened => {
                info!(page = %summary.title, keys = ?outcome.corrected_keys, "widened page");
                report.widened.push(link);
            }
            WidenStatus::WouldWiden => {
                info!(page = %summary.title, keys = ?outcome.corrected_keys, "would widen page");
                report.would_widen.push(link);
            }
            WidenStatus::NoProperties => report.without_properties += 1,
            WidenStatus::Conforming | WidenStatus::Failed => {}
        }
    }

    Ok(report)
}
