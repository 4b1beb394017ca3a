use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;

/// A listing entry. Listings are cached, so this type round-trips through JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    pub id: String,
    pub title: String,
}

/// A page as read from the store. Fields that were not requested in
/// [`ContentStore::get_page`] are left empty (`body`) or zero (`version`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub body: String,
    pub version: u64,
    pub last_modified: Option<String>,
}

impl Page {
    pub fn summary(&self) -> PageSummary {
        PageSummary {
            id: self.id.clone(),
            title: self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageProperty {
    pub property_id: String,
    pub key: String,
    pub value: Value,
    pub version: u64,
}

/// Remote content platform operations consumed by the batch stages.
///
/// Writes carry the version number the caller wants the resource to have after
/// the write (observed + 1). Implementations must reject a stale number with
/// [`crate::error::StoreError::VersionConflict`].
pub trait ContentStore {
    /// One window of the space listing. An empty window ends the listing.
    fn list_pages(
        &mut self,
        space: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<PageSummary>>;

    fn get_page(&mut self, id: &str, include_body: bool, include_version: bool)
    -> StoreResult<Page>;

    fn update_page_body(
        &mut self,
        id: &str,
        title: &str,
        body: &str,
        version: u64,
        minor_edit: bool,
    ) -> StoreResult<Page>;

    /// Fails with `NotFound` when the page carries no properties at all.
    fn get_properties(&mut self, id: &str) -> StoreResult<Vec<PageProperty>>;

    fn put_property(
        &mut self,
        page_id: &str,
        property_id: &str,
        key: &str,
        value: &Value,
        version: u64,
    ) -> StoreResult<()>;

    fn request_count(&self) -> usize;
}
