//! In-memory [`ContentStore`] shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::store::{ContentStore, Page, PageProperty, PageSummary};

pub const MOCK_EDIT_TIMESTAMP: &str = "2026-03-01T12:00:00Z";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpdate {
    pub id: String,
    pub body: String,
    pub version: u64,
    pub minor_edit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPropertyWrite {
    pub page_id: String,
    pub key: String,
    pub value: Value,
    pub version: u64,
}

#[derive(Default)]
pub struct MockStore {
    pub listings: BTreeMap<String, Vec<PageSummary>>,
    pub pages: BTreeMap<String, Page>,
    pub properties: BTreeMap<String, Vec<PageProperty>>,
    pub failing_fetches: BTreeSet<String>,
    pub conflicting_updates: BTreeSet<String>,
    /// Updates that are applied but answered with a transport failure.
    pub applied_then_failing_updates: BTreeSet<String>,
    pub failing_property_writes: BTreeSet<String>,
    pub failing_property_reads: BTreeSet<String>,
    pub updates: Vec<RecordedUpdate>,
    pub property_writes: Vec<RecordedPropertyWrite>,
    pub fetched: Vec<String>,
    pub list_calls: Vec<(usize, usize)>,
    /// Server-side cap on listing windows, below what the caller asks for.
    pub max_window: Option<usize>,
    request_count: usize,
}

impl MockStore {
    pub fn with_space(space: &str, pages: Vec<Page>) -> Self {
        let mut store = Self::default();
        store.listings.insert(
            space.to_string(),
            pages.iter().map(Page::summary).collect(),
        );
        for page in pages {
            store.pages.insert(page.id.clone(), page);
        }
        store
    }

    pub fn set_properties(&mut self, page_id: &str, properties: Vec<PageProperty>) {
        self.properties.insert(page_id.to_string(), properties);
    }
}

pub fn page(id: &str, title: &str, body: &str) -> Page {
    Page {
        id: id.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        version: 3,
        last_modified: Some("2026-01-10T08:30:00.000Z".to_string()),
    }
}

pub fn summary(id: &str, title: &str) -> PageSummary {
    PageSummary {
        id: id.to_string(),
        title: title.to_string(),
    }
}

pub fn property(property_id: &str, key: &str, value: &str, version: u64) -> PageProperty {
    PageProperty {
        property_id: property_id.to_string(),
        key: key.to_string(),
        value: Value::String(value.to_string()),
        version,
    }
}

impl ContentStore for MockStore {
    fn list_pages(
        &mut self,
        space: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<PageSummary>> {
        self.request_count += 1;
        self.list_calls.push((offset, limit));
        let listing = self
            .listings
            .get(space)
            .ok_or_else(|| StoreError::not_found(format!("space {space}")))?;
        let limit = self.max_window.map_or(limit, |cap| cap.min(limit));
        Ok(listing.iter().skip(offset).take(limit).cloned().collect())
    }

    fn get_page(
        &mut self,
        id: &str,
        include_body: bool,
        include_version: bool,
    ) -> StoreResult<Page> {
        self.request_count += 1;
        self.fetched.push(id.to_string());
        if self.failing_fetches.contains(id) {
            return Err(StoreError::Transport(format!("connection reset reading {id}")));
        }
        let mut page = self
            .pages
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("page {id}")))?;
        if !include_body {
            page.body.clear();
        }
        if !include_version {
            page.version = 0;
        }
        Ok(page)
    }

    fn update_page_body(
        &mut self,
        id: &str,
        title: &str,
        body: &str,
        version: u64,
        minor_edit: bool,
    ) -> StoreResult<Page> {
        self.request_count += 1;
        if self.conflicting_updates.contains(id) {
            return Err(StoreError::conflict(format!("page {id}"), version));
        }
        let page = self
            .pages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(format!("page {id}")))?;
        if version != page.version + 1 {
            return Err(StoreError::conflict(format!("page {id}"), version));
        }
        page.title = title.to_string();
        page.body = body.to_string();
        page.version = version;
        page.last_modified = Some(MOCK_EDIT_TIMESTAMP.to_string());
        self.updates.push(RecordedUpdate {
            id: id.to_string(),
            body: body.to_string(),
            version,
            minor_edit,
        });
        if self.applied_then_failing_updates.contains(id) {
            return Err(StoreError::Transport(format!("timed out waiting for reply on {id}")));
        }
        Ok(page.clone())
    }

    fn get_properties(&mut self, id: &str) -> StoreResult<Vec<PageProperty>> {
        self.request_count += 1;
        if self.failing_property_reads.contains(id) {
            return Err(StoreError::Transport(format!("timeout reading properties of {id}")));
        }
        self.properties
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("properties of page {id}")))
    }

    fn put_property(
        &mut self,
        page_id: &str,
        property_id: &str,
        key: &str,
        value: &Value,
        version: u64,
    ) -> StoreResult<()> {
        self.request_count += 1;
        if self.failing_property_writes.contains(property_id) {
            return Err(StoreError::conflict(format!("property {property_id}"), version));
        }
        let property = self
            .properties
            .get_mut(page_id)
            .and_then(|items| items.iter_mut().find(|item| item.property_id == property_id))
            .ok_or_else(|| StoreError::not_found(format!("property {property_id}")))?;
        if version != property.version + 1 {
            return Err(StoreError::conflict(format!("property {property_id}"), version));
        }
        property.value = value.clone();
        property.version = version;
        self.property_writes.push(RecordedPropertyWrite {
            page_id: page_id.to_string(),
            key: key.to_string(),
            value: value.clone(),
            version,
        });
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}
