use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::pattern::PatternCatalog;
use crate::report::{PageFailure, PageLink, SpaceScope};
use crate::store::{ContentStore, Page, PageSummary};

const DIFF_CONTEXT_WORDS: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub dry_run: bool,
    /// Maximum number of writes in this run; `0` means unlimited.
    pub limit: usize,
    /// Writes already made earlier in the same run (for example in another space).
    pub prior_updates: usize,
    /// Attach a word diff to each dry-run entry.
    pub include_diff: bool,
}

/// Result of running a catalog over one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    /// Catalog indices of the patterns that matched, in catalog order.
    pub matched: Vec<usize>,
    pub body: String,
}

impl Rewrite {
    pub fn is_match(&self) -> bool {
        !self.matched.is_empty()
    }
}

/// Applies the catalog cumulatively: each pattern sees the body as rewritten
/// by the patterns before it.
pub fn rewrite_body(body: &str, catalog: &PatternCatalog) -> Rewrite {
    let mut current = body.to_string();
    let mut matched = Vec::new();
    for (index, pattern) in catalog.iter().enumerate() {
        if !pattern.is_match(&current) {
            continue;
        }
        matched.push(index);
        if let Some(rewritten) = pattern.rewrite(&current) {
            current = rewritten;
        }
    }
    Rewrite {
        matched,
        body: current,
    }
}

#[derive(Debug, Clone)]
pub struct PatternOutcome {
    pub page: Page,
    pub matched: Vec<usize>,
    /// Present whenever any pattern matched, even if no pattern replaced anything.
    pub new_body: Option<String>,
}

impl PatternOutcome {
    pub fn is_match(&self) -> bool {
        self.new_body.is_some()
    }
}

/// Fetches the page (body and version) and runs the catalog over it.
pub fn apply_patterns<S: ContentStore>(
    store: &mut S,
    page_id: &str,
    catalog: &PatternCatalog,
) -> Result<PatternOutcome> {
    let page = store
        .get_page(page_id, true, true)
        .with_context(|| format!("failed to fetch page {page_id}"))?;
    let rewrite = rewrite_body(&page.body, catalog);
    let new_body = rewrite.is_match().then_some(rewrite.body);
    Ok(PatternOutcome {
        page,
        matched: rewrite.matched,
        new_body,
    })
}

/// `perform_update := (not dry_run) AND (limit == 0 OR updates_so_far < limit)`
pub fn update_allowed(dry_run: bool, limit: usize, updates_so_far: usize) -> bool {
    !dry_run && (limit == 0 || updates_so_far < limit)
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub page: PageLink,
    pub matched_patterns: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub dry_run: bool,
    pub checked: usize,
    pub duplicates_skipped: usize,
    pub updated: Vec<PageLink>,
    pub would_update: Vec<PlannedChange>,
    /// Matching pages left alone because the update limit was reached.
    pub held_back: Vec<PageLink>,
    pub conflicts: Vec<PageLink>,
    /// Writes that failed in transport or in decoding the reply. The server
    /// may have applied them, so they count against the limit.
    pub unconfirmed: Vec<PageFailure>,
    pub missing: Vec<String>,
    pub errors: Vec<PageFailure>,
}

impl UpdateReport {
    pub fn matched(&self) -> usize {
        self.updated.len()
            + self.would_update.len()
            + self.held_back.len()
            + self.conflicts.len()
            + self.unconfirmed.len()
    }

    /// Writes that may have reached the server: confirmed plus unconfirmed.
    /// A version conflict is a definite rejection and is not included.
    pub fn counted_writes(&self) -> usize {
        self.updated.len() + self.unconfirmed.len()
    }
}

/// Runs the catalog over `pages` and writes matching pages back, one cumulative
/// rewrite per page. Per-page failures are recorded and the batch continues.
pub fn update_pages<S: ContentStore>(
    store: &mut S,
    pages: &[PageSummary],
    catalog: &PatternCatalog,
    scope: &SpaceScope,
    options: &UpdateOptions,
) -> Result<UpdateReport> {
    let mut report = UpdateReport {
        dry_run: options.dry_run,
        ..UpdateReport::default()
    };
    let mut visited = HashSet::new();

    for (index, summary) in pages.iter().enumerate() {
        scope.progress("rewrite", index, pages.len());
        if !visited.insert(summary.id.as_str()) {
            report.duplicates_skipped += 1;
            continue;
        }
        report.checked += 1;

        let outcome = match apply_patterns(store, &summary.id, catalog) {
            Ok(outcome) => outcome,
            Err(error) => {
                if is_not_found(&error) {
                    warn!(page = %summary.id, "page disappeared; skipping");
                    report.missing.push(summary.id.clone());
                } else {
                    warn!(page = %summary.id, "skipping page: {error:#}");
                    report.errors.push(PageFailure {
                        page: scope.link(&summary.id, &summary.title),
                        message: format!("{error:#}"),
                    });
                }
                continue;
            }
        };
        let Some(new_body) = outcome.new_body else {
            continue;
        };
        let page = outcome.page;
        let link = scope.link(&page.id, &page.title);

        let updates_so_far = options.prior_updates + report.counted_writes();
        if !update_allowed(options.dry_run, options.limit, updates_so_far) {
            if options.dry_run {
                info!(page = %page.title, "would update page");
                let diff = options
                    .include_diff
                    .then(|| render_word_diff(&page.body, &new_body));
                report.would_update.push(PlannedChange {
                    page: link,
                    matched_patterns: outcome.matched,
                    diff,
                });
            } else {
                info!(page = %page.title, limit = options.limit, "update limit reached; not updating");
                report.held_back.push(link);
            }
            continue;
        }

        match store.update_page_body(&page.id, &page.title, &new_body, page.version + 1, false) {
            Ok(_) => {
                info!(page = %page.title, version = page.version + 1, "updated page");
                report.updated.push(link);
            }
            Err(error @ StoreError::VersionConflict { .. }) => {
                warn!(page = %page.title, "{error}; rerun to retry against the new version");
                report.conflicts.push(link);
            }
            Err(error @ (StoreError::Transport(_) | StoreError::Decode { .. })) => {
                warn!(page = %page.title, "update outcome unknown: {error}");
                report.unconfirmed.push(PageFailure {
                    page: link,
                    message: error.to_string(),
                });
            }
            Err(error) => {
                warn!(page = %page.title, "update failed: {error}");
                report.errors.push(PageFailure {
                    page: link,
                    message: error.to_string(),
                });
            }
        }
    }

    Ok(report)
}

pub(crate) fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_not_found)
}

/// Inline word diff: `[-removed-]{+inserted+}` with a few words of context,
/// hunks separated by `...` lines.
pub fn render_word_diff(before: &str, after: &str) -> String {
    let diff = TextDiff::from_words(before, after);
    let mut hunks = Vec::new();
    for group in diff.grouped_ops(DIFF_CONTEXT_WORDS) {
        let mut hunk = String::new();
        for op in &group {
            for change in diff.iter_changes(op) {
                match change.tag() {
                    ChangeTag::Equal => hunk.push_str(change.value()),
                    ChangeTag::Delete => {
                        hunk.push_str("[-");
                        hunk.push_str(change.value());
                        hunk.push_str("-]");
                    }
                    ChangeTag::Insert => {
                        hunk.push_str("{+");
                        hunk.push_str(change.value());
                        hunk.push_str("+}");
                    }
                }
            }
        }
        hunks.push(hunk);
    }
    hunks.join("\n...\n")
}

#[cfg(test)]
mod tests {
    use super::{
        UpdateOptions, apply_patterns, render_word_diff, rewrite_body, update_allowed,
        update_pages,
    };
    use crate::mock::{MockStore, page, summary};
    use crate::pattern::{Pattern, PatternCatalog};
    use crate::report::SpaceScope;

    fn scope() -> SpaceScope {
        SpaceScope {
            base_url: "https://acme.atlassian.net/wiki".to_string(),
            space: "DOCS".to_string(),
            progress_every: 50,
        }
    }

    fn catalog(patterns: Vec<Pattern>) -> PatternCatalog {
        PatternCatalog::new(patterns)
    }

    fn matching_store(count: usize) -> MockStore {
        let pages = (1..=count)
            .map(|n| page(&n.to_string(), &format!("Page {n}"), "owner OLD here"))
            .collect();
        MockStore::with_space("DOCS", pages)
    }

    #[test]
    fn rewrite_is_cumulative() {
        let rewrite = rewrite_body(
            "A",
            &catalog(vec![Pattern::replace("A", "B"), Pattern::replace("B", "C")]),
        );
        assert_eq!(rewrite.body, "C");
        assert_eq!(rewrite.matched, vec![0, 1]);
    }

    #[test]
    fn detection_only_match_still_qualifies() {
        let mut store = MockStore::with_space("DOCS", vec![page("1", "One", "has marker")]);
        let outcome = apply_patterns(&mut store, "1", &catalog(vec![Pattern::detect("marker")]))
            .expect("apply");
        assert!(outcome.is_match());
        assert_eq!(outcome.new_body.as_deref(), Some("has marker"));
    }

    #[test]
    fn gate_uses_explicit_precedence() {
        assert!(!update_allowed(true, 0, 0));
        assert!(!update_allowed(true, 5, 0));
        assert!(update_allowed(false, 0, 100));
        assert!(update_allowed(false, 2, 1));
        assert!(!update_allowed(false, 2, 2));
    }

    #[test]
    fn dry_run_never_writes() {
        let mut store = matching_store(4);
        let pages = store.listings["DOCS"].clone();
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions {
                dry_run: true,
                limit: 1,
                prior_updates: 0,
                include_diff: true,
            },
        )
        .expect("update");

        assert!(store.updates.is_empty());
        assert!(report.updated.is_empty());
        assert_eq!(report.would_update.len(), 4);
        let diff = report.would_update[0].diff.as_deref().expect("diff");
        assert!(diff.contains("[-OLD-]{+NEW+}"));
    }

    #[test]
    fn limit_caps_the_number_of_writes() {
        let mut store = matching_store(5);
        let pages = store.listings["DOCS"].clone();
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions {
                dry_run: false,
                limit: 2,
                prior_updates: 0,
                include_diff: false,
            },
        )
        .expect("update");

        assert_eq!(store.updates.len(), 2);
        assert_eq!(report.updated.len(), 2);
        assert_eq!(report.held_back.len(), 3);
        assert_eq!(report.matched(), 5);
    }

    #[test]
    fn prior_updates_count_against_the_limit() {
        let mut store = matching_store(3);
        let pages = store.listings["DOCS"].clone();
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions {
                dry_run: false,
                limit: 2,
                prior_updates: 1,
                include_diff: false,
            },
        )
        .expect("update");

        assert_eq!(store.updates.len(), 1);
        assert_eq!(report.held_back.len(), 2);
    }

    #[test]
    fn unconfirmed_write_counts_against_the_limit() {
        let mut store = matching_store(3);
        store.applied_then_failing_updates.insert("1".to_string());
        let pages = store.listings["DOCS"].clone();
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions {
                dry_run: false,
                limit: 1,
                prior_updates: 0,
                include_diff: false,
            },
        )
        .expect("update");

        let applied = store
            .updates
            .iter()
            .map(|update| update.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(applied, vec!["1"]);
        assert!(report.updated.is_empty());
        assert!(report.errors.is_empty());
        assert_eq!(report.unconfirmed.len(), 1);
        assert_eq!(report.unconfirmed[0].page.id, "1");
        assert_eq!(report.held_back.len(), 2);
        assert_eq!(report.counted_writes(), 1);
    }

    #[test]
    fn conflict_does_not_stop_the_batch() {
        let mut store = matching_store(3);
        store.conflicting_updates.insert("1".to_string());
        let pages = store.listings["DOCS"].clone();
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions::default_live(),
        )
        .expect("update");

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].id, "1");
        let written = store
            .updates
            .iter()
            .map(|update| update.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(written, vec!["2", "3"]);
    }

    #[test]
    fn update_carries_observed_version_plus_one() {
        let mut store = matching_store(1);
        let pages = store.listings["DOCS"].clone();
        update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions::default_live(),
        )
        .expect("update");

        assert_eq!(store.updates[0].version, 4);
        assert!(!store.updates[0].minor_edit);
    }

    #[test]
    fn duplicates_are_skipped_without_fetch() {
        let mut store = matching_store(2);
        let pages = vec![summary("1", "Page 1"), summary("1", "Page 1"), summary("2", "Page 2")];
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::detect("nothing")]),
            &scope(),
            &UpdateOptions::default_live(),
        )
        .expect("update");

        assert_eq!(report.checked, 2);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(store.fetched, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn fetch_failures_are_recorded_and_skipped() {
        let mut store = matching_store(3);
        store.failing_fetches.insert("2".to_string());
        store.pages.remove("3");
        let pages = store.listings["DOCS"].clone();
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions::default_live(),
        )
        .expect("update");

        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].page.id, "2");
        assert_eq!(report.missing, vec!["3".to_string()]);
    }

    #[test]
    fn end_to_end_single_match_in_three_pages() {
        let mut store = MockStore::with_space(
            "DOCS",
            vec![
                page("10", "Intro", "nothing to see"),
                page("11", "Owner", "<p>Owner: OLD</p>"),
                page("12", "Outro", "also nothing"),
            ],
        );
        let pages = store.listings["DOCS"].clone();
        let report = update_pages(
            &mut store,
            &pages,
            &catalog(vec![Pattern::replace("OLD", "NEW")]),
            &scope(),
            &UpdateOptions::default_live(),
        )
        .expect("update");

        assert_eq!(report.checked, 3);
        assert_eq!(store.updates.len(), 1);
        assert_eq!(store.updates[0].body, "<p>Owner: NEW</p>");
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.updated[0].title, "Owner");
        assert_eq!(
            report.updated[0].url,
            "https://acme.atlassian.net/wiki/spaces/DOCS/pages/11"
        );
    }

    #[test]
    fn word_diff_marks_changed_words() {
        let diff = render_word_diff("a b OLD c", "a b NEW c");
        assert!(diff.contains("[-OLD-]{+NEW+}"));
    }

    impl UpdateOptions {
        fn default_live() -> Self {
            Self {
                dry_run: false,
                limit: 0,
                prior_updates: 0,
                include_diff: false,
            }
        }
    }
}
