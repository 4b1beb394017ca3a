use serde::Serialize;
use tracing::info;

/// `{title, url}` entry used by every stage report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageLink {
    pub id: String,
    pub title: String,
    pub url: String,
}

impl PageLink {
    pub fn new(base_url: &str, space: &str, id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            url: page_url(base_url, space, id),
        }
    }
}

/// A page a stage gave up on; the batch carried on without it.
#[derive(Debug, Clone, Serialize)]
pub struct PageFailure {
    pub page: PageLink,
    pub message: String,
}

/// `{base_url}/spaces/{space}/pages/{id}`; a trailing slash on the base is dropped.
pub fn page_url(base_url: &str, space: &str, id: &str) -> String {
    format!(
        "{}/spaces/{space}/pages/{id}",
        base_url.trim_end_matches('/')
    )
}

/// Where the pages of a stage live and how often to report progress.
#[derive(Debug, Clone)]
pub struct SpaceScope {
    pub base_url: String,
    pub space: String,
    pub progress_every: usize,
}

impl SpaceScope {
    pub fn link(&self, id: &str, title: &str) -> PageLink {
        PageLink::new(&self.base_url, &self.space, id, title)
    }

    pub fn progress(&self, stage: &str, index: usize, total: usize) {
        if self.progress_every == 0 || index % self.progress_every != 0 {
            return;
        }
        let upper = (index + self.progress_every).min(total);
        info!(
            space = %self.space,
            "{stage}: checking pages ({index}-{upper}) / ({total})"
        );
    }
}
