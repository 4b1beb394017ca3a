use std::collections::HashSet;
use std::ops::Range;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::layout::{WidenStatus, widen_page};
use crate::pattern::escape_umlauts;
use crate::report::{PageFailure, PageLink, SpaceScope};
use crate::store::{ContentStore, PageSummary};

pub const DEFAULT_APPROVAL_LABEL: &str = "Freigabe am";
pub const APPROVAL_DATE_FORMAT: &str = "%Y-%m-%d";

/// An approval date found in a page body. `span` covers only the date token;
/// `date` is `None` when the token is not a calendar date (`2026-02-30`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalMarker {
    pub span: Range<usize>,
    pub date: Option<NaiveDate>,
}

/// Finds the "approved as of" date in a storage-format body.
pub trait ApprovalDateLocator {
    fn locate(&self, body: &str) -> Option<ApprovalMarker>;
}

/// Label text followed, possibly across markup, by a
/// `<time datetime="YYYY-MM-DD"` element.
#[derive(Debug, Clone)]
pub struct LabeledDateLocator {
    regex: Regex,
}

impl LabeledDateLocator {
    pub fn new(label: &str) -> Result<Self> {
        let label = escape_umlauts(label.trim());
        if label.is_empty() {
            bail!("approval label cannot be empty");
        }
        let expression = format!(
            r#"(?s){}.*?<time\s+datetime="(\d{{4}}-\d{{2}}-\d{{2}})""#,
            regex::escape(&label)
        );
        let regex = Regex::new(&expression)
            .with_context(|| format!("failed to build approval matcher for {label}"))?;
        Ok(Self { regex })
    }
}

impl ApprovalDateLocator for LabeledDateLocator {
    fn locate(&self, body: &str) -> Option<ApprovalMarker> {
        let token = self.regex.captures(body)?.get(1)?;
        let date = NaiveDate::parse_from_str(token.as_str(), APPROVAL_DATE_FORMAT).ok();
        if date.is_none() {
            warn!(stamp = token.as_str(), "approval stamp is not a valid date");
        }
        Some(ApprovalMarker {
            span: token.range(),
            date,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    NotFound,
    /// A stamp was found but does not hold a valid date.
    Unreadable,
    UpToDate,
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshOptions {
    pub dry_run: bool,
    /// Date written into stale pages.
    pub today: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub id: String,
    pub title: String,
    pub state: ReviewState,
    pub approved: Option<NaiveDate>,
    pub last_modified: Option<NaiveDate>,
    pub new_date: Option<NaiveDate>,
    pub written: bool,
    pub widen: Option<WidenStatus>,
}

/// UTC date of a platform timestamp (RFC 3339).
pub fn parse_modified_date(timestamp: &str) -> Result<NaiveDate> {
    DateTime::parse_from_rfc3339(timestamp.trim())
        .map(|parsed| parsed.with_timezone(&Utc).date_naive())
        .with_context(|| format!("unparseable last-modified timestamp: {timestamp}"))
}

/// Brings the approval date of one page up to `options.today` when the page
/// was modified after it. Fetch and timestamp failures are returned.
pub fn refresh_page<S, L>(
    store: &mut S,
    page_id: &str,
    locator: &L,
    options: &RefreshOptions,
) -> Result<RefreshOutcome>
where
    S: ContentStore,
    L: ApprovalDateLocator + ?Sized,
{
    let page = store
        .get_page(page_id, true, true)
        .with_context(|| format!("failed to fetch page {page_id}"))?;
    let mut outcome = RefreshOutcome {
        id: page.id.clone(),
        title: page.title.clone(),
        state: ReviewState::NotFound,
        approved: None,
        last_modified: None,
        new_date: None,
        written: false,
        widen: None,
    };

    let Some(marker) = locator.locate(&page.body) else {
        return Ok(outcome);
    };
    let Some(approved) = marker.date else {
        outcome.state = ReviewState::Unreadable;
        return Ok(outcome);
    };
    outcome.approved = Some(approved);

    let timestamp = page
        .last_modified
        .as_deref()
        .with_context(|| format!("page {page_id} has no last-modified timestamp"))?;
    let modified = parse_modified_date(timestamp)?;
    outcome.last_modified = Some(modified);
    if modified <= approved {
        outcome.state = ReviewState::UpToDate;
        return Ok(outcome);
    }

    outcome.state = ReviewState::Stale;
    outcome.new_date = Some(options.today);
    if options.dry_run {
        return Ok(outcome);
    }

    let replacement = options.today.format(APPROVAL_DATE_FORMAT).to_string();
    let mut body = String::with_capacity(page.body.len());
    body.push_str(&page.body[..marker.span.start]);
    body.push_str(&replacement);
    body.push_str(&page.body[marker.span.end..]);
    store
        .update_page_body(&page.id, &page.title, &body, page.version + 1, true)
        .with_context(|| format!("failed to update approval date of {}", page.title))?;
    outcome.written = true;

    // A body edit can reset the page appearance.
    outcome.widen = Some(match widen_page(store, &page.id, false) {
        Ok(widened) => widened.status,
        Err(error) => {
            warn!(page = %page.title, "re-widening after date update failed: {error:#}");
            WidenStatus::Failed
        }
    });
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleEntry {
    pub page: PageLink,
    pub approved: Option<NaiveDate>,
    pub last_modified: Option<NaiveDate>,
    pub new_date: Option<NaiveDate>,
    pub written: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub dry_run: bool,
    pub checked: usize,
    pub not_found: usize,
    /// Pages whose approval stamp holds an invalid date.
    pub unreadable: Vec<PageLink>,
    pub up_to_date: usize,
    pub stale: Vec<StaleEntry>,
    pub conflicts: Vec<PageLink>,
    pub errors: Vec<PageFailure>,
}

impl RefreshReport {
    pub fn refreshed(&self) -> usize {
        self.stale.iter().filter(|entry| entry.written).count()
    }
}

pub fn refresh_pages<S, L>(
    store: &mut S,
    pages: &[PageSummary],
    locator: &L,
    scope: &SpaceScope,
    options: &RefreshOptions,
) -> Result<RefreshReport>
where
    S: ContentStore,
    L: ApprovalDateLocator + ?Sized,
{
    let mut report = RefreshReport {
        dry_run: options.dry_run,
        ..RefreshReport::default()
    };
    let mut visited = HashSet::new();

    for (index, summary) in pages.iter().enumerate() {
        scope.progress("refresh-dates", index, pages.len());
        if !visited.insert(summary.id.as_str()) {
            continue;
        }
        report.checked += 1;
        let link = scope.link(&summary.id, &summary.title);

        let outcome = match refresh_page(store, &summary.id, locator, options) {
            Ok(outcome) => outcome,
            Err(error) => {
                let conflict = error
                    .downcast_ref::<StoreError>()
                    .is_some_and(StoreError::is_conflict);
                if conflict {
                    warn!(page = %summary.title, "version conflict; date not refreshed");
                    report.conflicts.push(link);
                } else {
                    warn!(page = %summary.title, "skipping page: {error:#}");
                    report.errors.push(PageFailure {
                        page: link,
                        message: format!("{error:#}"),
                    });
                }
                continue;
            }
        };

        match outcome.state {
            ReviewState::NotFound => report.not_found += 1,
            ReviewState::Unreadable => {
                warn!(page = %outcome.title, "approval stamp unreadable; date not refreshed");
                report.unreadable.push(scope.link(&outcome.id, &outcome.title));
            }
            ReviewState::UpToDate => report.up_to_date += 1,
            ReviewState::Stale => {
                let verb = if outcome.written {
                    "refreshed approval date"
                } else {
                    "would refresh approval date"
                };
                info!(
                    page = %outcome.title,
                    approved = ?outcome.approved,
                    modified = ?outcome.last_modified,
                    "{verb}"
                );
                report.stale.push(StaleEntry {
                    page: scope.link(&outcome.id, &outcome.title),
                    approved: outcome.approved,
                    last_modified: outcome.last_modified,
                    new_date: outcome.new_date,
                    written: outcome.written,
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        ApprovalDateLocator, LabeledDateLocator, RefreshOptions, ReviewState, parse_modified_date,
        refresh_page, refresh_pages,
    };
    use crate::layout::{FULL_WIDTH, LAYOUT_PUBLISHED_KEY, WidenStatus};
    use crate::mock::{MockStore, page, property};
    use crate::report::SpaceScope;
    use crate::store::Page;

    const BODY: &str = r#"<table><tr><th><p><strong>Freigabe am</strong></p></th><td><p><time datetime="2026-01-09" /></p></td></tr></table>"#;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn locator() -> LabeledDateLocator {
        LabeledDateLocator::new("Freigabe am").expect("locator")
    }

    fn page_modified(id: &str, body: &str, modified: &str) -> Page {
        let mut page = page(id, &format!("Page {id}"), body);
        page.last_modified = Some(modified.to_string());
        page
    }

    fn options(dry_run: bool) -> RefreshOptions {
        RefreshOptions {
            dry_run,
            today: date("2026-10-17"),
        }
    }

    #[test]
    fn locator_spans_only_the_date_token() {
        let marker = locator().locate(BODY).expect("marker");
        assert_eq!(&BODY[marker.span.clone()], "2026-01-09");
        assert_eq!(marker.date, Some(date("2026-01-09")));
    }

    #[test]
    fn locator_escapes_umlauts_in_label() {
        let locator = LabeledDateLocator::new("Review durchgeführt am").expect("locator");
        let body = r#"Review durchgef&uuml;hrt am</th><td><time datetime="2025-12-01" />"#;
        assert_eq!(
            locator.locate(body).expect("marker").date,
            Some(date("2025-12-01"))
        );
    }

    #[test]
    fn missing_marker_is_not_found() {
        let mut store = MockStore::with_space("S", vec![page("1", "One", "<p>nothing</p>")]);
        let outcome = refresh_page(&mut store, "1", &locator(), &options(false)).expect("refresh");
        assert_eq!(outcome.state, ReviewState::NotFound);
        assert!(store.updates.is_empty());
    }

    #[test]
    fn same_day_modification_is_up_to_date() {
        let mut store = MockStore::with_space(
            "S",
            vec![page_modified("1", BODY, "2026-01-09T23:10:00.000Z")],
        );
        let outcome = refresh_page(&mut store, "1", &locator(), &options(false)).expect("refresh");
        assert_eq!(outcome.state, ReviewState::UpToDate);
        assert!(store.updates.is_empty());
    }

    #[test]
    fn next_day_modification_is_stale_and_rewritten() {
        let mut store = MockStore::with_space(
            "S",
            vec![page_modified("1", BODY, "2026-01-10T00:05:00.000Z")],
        );
        store.set_properties("1", vec![property("p1", LAYOUT_PUBLISHED_KEY, "fixed", 1)]);

        let outcome = refresh_page(&mut store, "1", &locator(), &options(false)).expect("refresh");
        assert_eq!(outcome.state, ReviewState::Stale);
        assert!(outcome.written);
        assert_eq!(store.updates.len(), 1);
        let update = &store.updates[0];
        assert!(update.minor_edit);
        assert_eq!(update.version, 4);
        assert_eq!(update.body, BODY.replace("2026-01-09", "2026-10-17"));
        assert_eq!(outcome.widen, Some(WidenStatus::Widened));
        assert_eq!(store.property_writes[0].value, FULL_WIDTH);
    }

    #[test]
    fn dry_run_reports_stale_without_writing_or_widening() {
        let mut store = MockStore::with_space(
            "S",
            vec![page_modified("1", BODY, "2026-02-01T10:00:00Z")],
        );
        store.set_properties("1", vec![property("p1", LAYOUT_PUBLISHED_KEY, "fixed", 1)]);
        let outcome = refresh_page(&mut store, "1", &locator(), &options(true)).expect("refresh");
        assert_eq!(outcome.state, ReviewState::Stale);
        assert_eq!(outcome.new_date, Some(date("2026-10-17")));
        assert!(store.updates.is_empty());
        assert!(store.property_writes.is_empty());
    }

    #[test]
    fn unparseable_timestamp_is_page_fatal() {
        let mut store = MockStore::with_space("S", vec![page_modified("1", BODY, "yesterday")]);
        let error = refresh_page(&mut store, "1", &locator(), &options(false)).expect_err("fail");
        assert!(error.to_string().contains("unparseable last-modified timestamp"));
    }

    #[test]
    fn batch_isolates_failures_and_conflicts() {
        let mut store = MockStore::with_space(
            "S",
            vec![
                page_modified("1", BODY, "not a timestamp"),
                page_modified("2", BODY, "2026-05-05T10:00:00Z"),
                page_modified("3", BODY, "2026-05-05T10:00:00Z"),
                page_modified("4", "<p>no marker</p>", "2026-05-05T10:00:00Z"),
                page_modified("5", BODY, "2025-12-31T10:00:00Z"),
            ],
        );
        store.conflicting_updates.insert("2".to_string());
        let pages = store.listings["S"].clone();
        let scope = SpaceScope {
            base_url: "https://wiki".to_string(),
            space: "S".to_string(),
            progress_every: 2,
        };

        let report = refresh_pages(&mut store, &pages, &locator(), &scope, &options(false))
            .expect("refresh");
        assert_eq!(report.checked, 5);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.refreshed(), 1);
        assert_eq!(report.stale[0].page.id, "3");
        assert_eq!(report.not_found, 1);
        assert_eq!(report.up_to_date, 1);
    }

    #[test]
    fn modified_date_is_taken_in_utc() {
        assert_eq!(
            parse_modified_date("2026-03-01T00:30:00+02:00").expect("parse"),
            date("2026-02-28")
        );
        assert_eq!(
            parse_modified_date("2026-01-09T23:10:00.000Z").expect("parse"),
            date("2026-01-09")
        );
    }

    #[test]
    fn impossible_stamp_is_unreadable_not_missing() {
        let body = BODY.replace("2026-01-09", "2026-02-30");
        let marker = locator().locate(&body).expect("marker");
        assert_eq!(marker.date, None);

        let mut store = MockStore::with_space(
            "S",
            vec![
                page_modified("1", &body, "2026-03-05T08:00:00Z"),
                page("2", "Two", "<p>no stamp</p>"),
            ],
        );
        let pages = store.listings["S"].clone();
        let scope = SpaceScope {
            base_url: "https://wiki.example.org".to_string(),
            space: "S".to_string(),
            progress_every: 50,
        };
        let report =
            refresh_pages(&mut store, &pages, &locator(), &scope, &options(false)).expect("refresh");

        assert_eq!(report.unreadable.len(), 1);
        assert_eq!(report.unreadable[0].id, "1");
        assert_eq!(report.not_found, 1);
        assert!(store.updates.is_empty());
    }
}
