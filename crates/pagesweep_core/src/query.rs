use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::pattern::PatternCatalog;
use crate::report::{PageFailure, PageLink, SpaceScope};
use crate::store::{ContentStore, PageSummary};
use crate::transform::is_not_found;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FindReport {
    pub negate: bool,
    pub checked: usize,
    pub pages: Vec<PageLink>,
    pub missing: Vec<String>,
    pub errors: Vec<PageFailure>,
}

/// Pages with at least one catalog match, or with none when `negate` is set.
/// Read-only: nothing is ever written back.
pub fn find_pages<S: ContentStore>(
    store: &mut S,
    pages: &[PageSummary],
    catalog: &PatternCatalog,
    negate: bool,
    scope: &SpaceScope,
) -> Result<FindReport> {
    let mut report = FindReport {
        negate,
        ..FindReport::default()
    };
    let mut visited = HashSet::new();

    for (index, summary) in pages.iter().enumerate() {
        scope.progress("find", index, pages.len());
        if !visited.insert(summary.id.as_str()) {
            continue;
        }
        report.checked += 1;

        let fetched = store
            .get_page(&summary.id, true, false)
            .with_context(|| format!("failed to fetch page {}", summary.id));
        let page = match fetched {
            Ok(page) => page,
            Err(error) if is_not_found(&error) => {
                report.missing.push(summary.id.clone());
                continue;
            }
            Err(error) => {
                warn!(page = %summary.id, "skipping page: {error:#}");
                report.errors.push(PageFailure {
                    page: scope.link(&summary.id, &summary.title),
                    message: format!("{error:#}"),
                });
                continue;
            }
        };

        let matched = catalog.first_match(&page.body).is_some();
        if matched != negate {
            report.pages.push(scope.link(&page.id, &page.title));
        }
    }

    Ok(report)
}
