use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::cache::LocalCache;
use crate::layout::{WidenReport, widen_pages};
use crate::listing::list_unique_pages_cached;
use crate::pattern::PatternCatalog;
use crate::query::{FindReport, find_pages};
use crate::report::SpaceScope;
use crate::review::{ApprovalDateLocator, RefreshOptions, RefreshReport, refresh_pages};
use crate::store::ContentStore;
use crate::transform::{UpdateOptions, UpdateReport, update_pages};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMode {
    /// Report pages with a match (or, negated, without one). Never writes.
    Find { negate: bool },
    Rewrite { include_diff: bool },
}

#[derive(Debug, Clone)]
pub struct PatternJob {
    pub catalog: PatternCatalog,
    pub mode: PatternMode,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub base_url: String,
    pub dry_run: bool,
    pub update_limit: usize,
    pub use_cache: bool,
    pub page_size: usize,
    pub progress_every: usize,
    pub widen: bool,
    pub patterns: Option<PatternJob>,
    /// Run the date refresher, stamping stale pages with this date.
    pub refresh_today: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceReport {
    pub space: String,
    pub pages_found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widen: Option<WidenReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub find: Option<FindReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<UpdateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub dry_run: bool,
    pub spaces: Vec<SpaceReport>,
    pub request_count: usize,
}

impl PipelineReport {
    /// Body writes counted against the update limit so far.
    pub fn counted_writes(&self) -> usize {
        self.spaces
            .iter()
            .filter_map(|space| space.rewrite.as_ref())
            .map(UpdateReport::counted_writes)
            .sum()
    }
}

/// List → widen → find/rewrite → refresh dates, for one space.
/// `prior_updates` counts body writes already made earlier in the run.
pub fn run_space<S, L>(
    store: &mut S,
    cache: &LocalCache,
    space: &str,
    options: &PipelineOptions,
    locator: &L,
    prior_updates: usize,
) -> Result<SpaceReport>
where
    S: ContentStore,
    L: ApprovalDateLocator + ?Sized,
{
    info!(space, "examining space");
    let pages = list_unique_pages_cached(
        cache,
        store,
        &options.base_url,
        space,
        options.page_size,
        options.use_cache,
    )
    .with_context(|| format!("failed to enumerate pages of {space}"))?;
    info!(space, pages = pages.len(), "found pages");

    let scope = SpaceScope {
        base_url: options.base_url.clone(),
        space: space.to_string(),
        progress_every: options.progress_every,
    };
    let mut report = SpaceReport {
        space: space.to_string(),
        pages_found: pages.len(),
        widen: None,
        find: None,
        rewrite: None,
        refresh: None,
    };

    if options.widen {
        info!(space, "widening pages");
        report.widen = Some(widen_pages(store, &pages, &scope, options.dry_run)?);
    }

    if let Some(job) = &options.patterns {
        match job.mode {
            PatternMode::Find { negate } => {
                info!(space, negate, "finding pattern matches");
                report.find = Some(find_pages(store, &pages, &job.catalog, negate, &scope)?);
            }
            PatternMode::Rewrite { include_diff } => {
                info!(space, patterns = job.catalog.len(), "rewriting matching pages");
                let update_options = UpdateOptions {
                    dry_run: options.dry_run,
                    limit: options.update_limit,
                    prior_updates,
                    include_diff,
                };
                report.rewrite = Some(update_pages(
                    store,
                    &pages,
                    &job.catalog,
                    &scope,
                    &update_options,
                )?);
            }
        }
    }

    if let Some(today) = options.refresh_today {
        info!(space, "refreshing approval dates");
        let refresh_options = RefreshOptions {
            dry_run: options.dry_run,
            today,
        };
        report.refresh = Some(refresh_pages(
            store,
            &pages,
            locator,
            &scope,
            &refresh_options,
        )?);
    }

    Ok(report)
}

pub fn run_pipeline<S, L>(
    store: &mut S,
    cache: &LocalCache,
    spaces: &[String],
    options: &PipelineOptions,
    locator: &L,
) -> Result<PipelineReport>
where
    S: ContentStore,
    L: ApprovalDateLocator + ?Sized,
{
    let mut report = PipelineReport {
        dry_run: options.dry_run,
        spaces: Vec::with_capacity(spaces.len()),
        request_count: 0,
    };
    for space in spaces {
        let prior_updates = report.counted_writes();
        let space_report = run_space(store, cache, space, options, locator, prior_updates)?;
        report.spaces.push(space_report);
    }
    report.request_count = store.request_count();
    Ok(report)
}
