use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::SweepConfig;
use crate::error::{StoreError, StoreResult};
use crate::store::{ContentStore, Page, PageProperty, PageSummary};

pub const DEFAULT_USER_AGENT: &str = "pagesweep/0.1";

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub username: String,
    pub api_token: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &SweepConfig) -> Result<Self> {
        let base_url = config
            .base_url()
            .context("missing confluence_base_url (config or CONFLUENCE_BASE_URL)")?;
        let (username, api_token) = config.credentials()?;
        Ok(Self {
            base_url,
            username,
            api_token,
            user_agent: env_value("CONFLUENCE_USER_AGENT", DEFAULT_USER_AGENT),
            timeout_ms: env_value_u64("CONFLUENCE_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("CONFLUENCE_RATE_LIMIT_READ", 100),
            rate_limit_write_ms: env_value_u64("CONFLUENCE_RATE_LIMIT_WRITE", 500),
            max_retries: env_value_usize("CONFLUENCE_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("CONFLUENCE_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("CONFLUENCE_HTTP_RETRY_DELAY_MS", 500),
        })
    }
}

/// Blocking Confluence Cloud binding: REST v1 for page listing, reads and
/// updates; REST v2 for content properties.
pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    base_url: Url,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        let base_url = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))
            .with_context(|| format!("invalid confluence_base_url: {}", config.base_url))?;

        Ok(Self {
            client,
            config,
            base_url,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> StoreResult<Url> {
        self.base_url
            .join(path)
            .map_err(|error| StoreError::Transport(format!("invalid endpoint {path}: {error}")))
    }

    fn request<T: DeserializeOwned>(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        resource: &str,
    ) -> StoreResult<T> {
        let is_write = method != Method::GET;
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let url = self.endpoint(path)?;

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .basic_auth(&self.config.username, Some(&self.config.api_token))
                .header("User-Agent", self.config.user_agent.clone())
                .header("Accept", "application/json");
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().map_err(|error| StoreError::Decode {
                            what: resource.to_string(),
                            message: error.to_string(),
                        });
                    }
                    if attempt < max_retries && is_retryable_status(status, is_write) {
                        debug!(%status, attempt, resource, "retrying Confluence request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    let detail = response.text().unwrap_or_default();
                    return Err(classify_status(status, &detail, resource, body));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error, is_write) {
                        debug!(attempt, resource, "retrying Confluence request: {error}");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(StoreError::Transport(format!(
                        "{method} {resource} failed: {error}"
                    )));
                }
            }
        }

        Err(StoreError::Transport(format!(
            "{method} {resource} exhausted retry budget"
        )))
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }
}

impl ContentStore for ConfluenceClient {
    fn list_pages(
        &mut self,
        space: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<PageSummary>> {
        let response: ContentListResponse = self.request(
            Method::GET,
            "rest/api/content",
            &[
                ("spaceKey", space.to_string()),
                ("type", "page".to_string()),
                ("start", offset.to_string()),
                ("limit", limit.to_string()),
            ],
            None,
            &format!("space {space}"),
        )?;
        Ok(response
            .results
            .into_iter()
            .map(|item| PageSummary {
                id: item.id,
                title: item.title,
            })
            .collect())
    }

    fn get_page(
        &mut self,
        id: &str,
        include_body: bool,
        include_version: bool,
    ) -> StoreResult<Page> {
        let mut expand = Vec::new();
        if include_body {
            expand.push("body.storage");
        }
        if include_version {
            expand.push("version");
        }
        let mut query = Vec::new();
        if !expand.is_empty() {
            query.push(("expand", expand.join(",")));
        }

        let item: ContentItem = self.request(
            Method::GET,
            &format!("rest/api/content/{id}"),
            &query,
            None,
            &format!("page {id}"),
        )?;
        Ok(item.into_page())
    }

    fn update_page_body(
        &mut self,
        id: &str,
        title: &str,
        body: &str,
        version: u64,
        minor_edit: bool,
    ) -> StoreResult<Page> {
        let payload = json!({
            "id": id,
            "type": "page",
            "status": "current",
            "title": title,
            "body": {
                "storage": {
                    "value": body,
                    "representation": "storage",
                },
            },
            "version": {
                "number": version,
                "minorEdit": minor_edit,
            },
        });
        let item: ContentItem = self.request(
            Method::PUT,
            &format!("rest/api/content/{id}"),
            &[],
            Some(&payload),
            &format!("page {id}"),
        )?;
        Ok(item.into_page())
    }

    fn get_properties(&mut self, id: &str) -> StoreResult<Vec<PageProperty>> {
        let mut properties = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("limit", "250".to_string())];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }
            let response: PropertyListResponse = self.request(
                Method::GET,
                &format!("api/v2/pages/{id}/properties"),
                &query,
                None,
                &format!("properties of page {id}"),
            )?;
            for item in response.results {
                properties.push(PageProperty {
                    property_id: item.id,
                    key: item.key,
                    value: item.value,
                    version: item.version.map(|version| version.number).unwrap_or(0),
                });
            }

            cursor = response
                .links
                .and_then(|links| links.next)
                .and_then(|next| self.base_url.join(&next).ok())
                .and_then(|next| {
                    next.query_pairs()
                        .find(|(key, _)| key == "cursor")
                        .map(|(_, value)| value.into_owned())
                });
            if cursor.is_none() {
                break;
            }
        }

        properties_or_not_found(id, properties)
    }

    fn put_property(
        &mut self,
        page_id: &str,
        property_id: &str,
        key: &str,
        value: &Value,
        version: u64,
    ) -> StoreResult<()> {
        let payload = json!({
            "key": key,
            "value": value,
            "version": {
                "number": version,
                "message": "pagesweep layout normalization",
            },
        });
        let _: Value = self.request(
            Method::PUT,
            &format!("api/v2/pages/{page_id}/properties/{property_id}"),
            &[],
            Some(&payload),
            &format!("property {key} of page {page_id}"),
        )?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// A page without any property is reported as `NotFound`, like a 404.
fn properties_or_not_found(
    page_id: &str,
    properties: Vec<PageProperty>,
) -> StoreResult<Vec<PageProperty>> {
    if properties.is_empty() {
        return Err(StoreError::not_found(format!("properties of page {page_id}")));
    }
    Ok(properties)
}

/// 404 → `NotFound`, 409 → `VersionConflict` (with the version number the
/// request submitted), everything else → `Transport`.
fn classify_status(
    status: StatusCode,
    detail: &str,
    resource: &str,
    body: Option<&Value>,
) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::not_found(resource),
        StatusCode::CONFLICT => {
            let submitted = body
                .and_then(|payload| payload.pointer("/version/number"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            StoreError::conflict(resource, submitted)
        }
        _ => {
            let detail = detail.chars().take(300).collect::<String>();
            StoreError::Transport(format!("{resource}: HTTP {status}: {detail}"))
        }
    }
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

/// Writes are only retried when the server certainly did not apply them;
/// a repeated PUT after a gateway timeout could land twice.
fn is_retryable_status(status: StatusCode, is_write: bool) -> bool {
    if is_write {
        return status == StatusCode::TOO_MANY_REQUESTS;
    }
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error, is_write: bool) -> bool {
    if is_write {
        return error.is_connect();
    }
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct ContentListResponse {
    #[serde(default)]
    results: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    title: String,
    #[serde(default)]
    body: Option<ContentBody>,
    #[serde(default)]
    version: Option<ContentVersion>,
}

impl ContentItem {
    fn into_page(self) -> Page {
        let (version, last_modified) = match self.version {
            Some(version) => (version.number, version.when),
            None => (0, None),
        };
        Page {
            id: self.id,
            title: self.title,
            body: self
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
            version,
            last_modified,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    #[serde(default)]
    storage: Option<StorageValue>,
}

#[derive(Debug, Deserialize)]
struct StorageValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ContentVersion {
    number: u64,
    #[serde(default)]
    when: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PropertyListResponse {
    #[serde(default)]
    results: Vec<PropertyItem>,
    #[serde(default, rename = "_links")]
    links: Option<PropertyLinks>,
}

#[derive(Debug, Deserialize)]
struct PropertyItem {
    id: String,
    key: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    version: Option<PropertyVersion>,
}

#[derive(Debug, Deserialize)]
struct PropertyVersion {
    number: u64,
}

#[derive(Debug, Deserialize, Default)]
struct PropertyLinks {
    #[serde(default)]
    next: Option<String>,
}
