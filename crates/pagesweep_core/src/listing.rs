use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::cache::LocalCache;
use crate::store::{ContentStore, PageSummary};

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Every page of `space`, each id once, in first-seen order.
///
/// Offset windows can repeat entries across their boundaries when the space
/// changes mid-listing; repeats are dropped here.
pub fn list_unique_pages<S: ContentStore>(
    store: &mut S,
    space: &str,
    page_size: usize,
) -> Result<Vec<PageSummary>> {
    let mut seen = HashSet::new();
    let mut pages = Vec::new();
    for_each_window(store, space, page_size, |window| {
        for summary in window {
            if seen.insert(summary.id.clone()) {
                pages.push(summary);
            }
        }
        pages.len()
    })?;
    info!(space, pages = pages.len(), "listed unique pages");
    Ok(pages)
}

/// Raw listing, duplicates included.
pub fn list_all_pages<S: ContentStore>(
    store: &mut S,
    space: &str,
    page_size: usize,
) -> Result<Vec<PageSummary>> {
    let mut pages = Vec::new();
    for_each_window(store, space, page_size, |window| {
        pages.extend(window);
        pages.len()
    })?;
    Ok(pages)
}

/// Cached variant of [`list_unique_pages`] keyed by [`listing_cache_key`].
pub fn list_unique_pages_cached<S: ContentStore>(
    cache: &LocalCache,
    store: &mut S,
    site: &str,
    space: &str,
    page_size: usize,
    use_cache: bool,
) -> Result<Vec<PageSummary>> {
    cache.get_or_compute(&listing_cache_key(site, space), use_cache, || {
        list_unique_pages(store, space, page_size)
    })
}

/// `pages_<space>@<site>`; the site is the base URL without scheme, so two
/// wikis with the same space key never share a listing.
pub fn listing_cache_key(site: &str, space: &str) -> String {
    let site = site
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    format!("pages_{space}@{site}")
}

fn for_each_window<S, F>(store: &mut S, space: &str, page_size: usize, mut visit: F) -> Result<()>
where
    S: ContentStore,
    F: FnMut(Vec<PageSummary>) -> usize,
{
    if page_size == 0 {
        bail!("listing page size must be greater than zero");
    }

    let mut offset = 0usize;
    loop {
        let window = store
            .list_pages(space, offset, page_size)
            .with_context(|| format!("failed to list pages of {space} at offset {offset}"))?;
        if window.is_empty() {
            break;
        }
        let received = window.len();
        if received < page_size {
            debug!(space, offset, received, page_size, "server returned a short window");
        }
        let collected = visit(window);
        debug!(space, offset, collected, "listing window received");
        // Advance by what arrived: servers may cap the window below `page_size`.
        offset += received;
    }
    Ok(())
}
