//! HTTP backend for the hosted store.
//!
//! Speaks the PostgREST dialect exposed under `/rest/v1/<table>`: equality
//! filters as `column=eq.value`, `order=column.asc`, `limit=n`, and
//! `Prefer: return=representation` so inserts echo the generated rows.
//!
//! Change notifications are produced by a polling task per subscription. Each
//! poll fingerprints a table by its newest `updated_at` and its exact row
//! count; a changed fingerprint becomes one notification. A growing count is
//! reported as an insert, a shrinking count as a delete, anything else as an
//! update.
//!
//! # Security Note
//!
//! The access key is sent in the `apikey` and `Authorization` headers. Both
//! header values are marked sensitive so they are redacted from reqwest's
//! debug output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::error::{HoldbackError, Result};

use super::error::{ApiError, execute_with_retry};
use super::{
    Backend, ChangeEvent, ChangeKind, Query, Record, RowId, Subscription, SubscriptionId, Topic,
};

const REST_PATH: &str = "rest/v1/";

/// Request plumbing shared by the backend and its pollers.
#[derive(Clone)]
struct RestClient {
    client: Client,
    base: Url,
    key: SecretString,
}

impl RestClient {
    fn table_url(&self, table: &str) -> Result<Url> {
        Ok(self.base.join(REST_PATH)?.join(table)?)
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let key = self.key.expose_secret();
        let mut apikey = HeaderValue::from_str(key)
            .map_err(|_| HoldbackError::Config("access key is not a valid header value".into()))?;
        apikey.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| HoldbackError::Config("access key is not a valid header value".into()))?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("apikey", apikey);
        headers.insert(header::AUTHORIZATION, bearer);
        Ok(headers)
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, url)
            .headers(self.auth_headers()?))
    }

    /// Send a request with retries, turning non-success statuses into errors.
    ///
    /// Only for idempotent requests; a retried POST could apply twice.
    async fn send(&self, build: impl Fn() -> Result<RequestBuilder>) -> Result<Response> {
        let build = &build;
        Ok(execute_with_retry(|| self.attempt(build)).await?)
    }

    /// Send a request exactly once
    async fn send_once(&self, build: impl Fn() -> Result<RequestBuilder>) -> Result<Response> {
        Ok(self.attempt(&build).await?)
    }

    async fn attempt(
        &self,
        build: &impl Fn() -> Result<RequestBuilder>,
    ) -> std::result::Result<Response, ApiError> {
        let request = build().map_err(|e| ApiError::new(e.to_string()))?;
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let mut err = ApiError::with_status(error_message(&body), status);
        if let Some(seconds) = retry_after {
            err = err.with_retry_after(seconds);
        }
        Err(err)
    }

    async fn fingerprint(&self, table: &str) -> Result<Fingerprint> {
        let url = self.table_url(table)?;
        let response = self
            .send(|| {
                Ok(self
                    .request(Method::GET, url.clone())?
                    .query(&[
                        ("select", "id,updated_at"),
                        ("order", "updated_at.desc.nullslast"),
                        ("limit", "1"),
                    ])
                    .header("Prefer", "count=exact"))
            })
            .await?;

        let count = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let rows: Vec<Record> = response.json().await?;
        let newest = rows.first();
        Ok(Fingerprint {
            latest: newest
                .and_then(|r| r.get("updated_at"))
                .and_then(Value::as_str)
                .map(str::to_string),
            newest_id: newest.and_then(|r| r.get("id")).and_then(Value::as_i64),
            count,
        })
    }
}

/// Hosted-store client over HTTP.
pub struct RestBackend {
    inner: RestClient,
    poll_interval: Duration,
    pollers: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_subscription: AtomicU64,
}

impl RestBackend {
    pub fn new(base_url: &str, key: SecretString, poll_interval: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            inner: RestClient { client, base, key },
            poll_interval,
            pollers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Build from configuration; URL and key are required.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.require_url()?,
            config.require_key()?.clone(),
            config.poll_interval,
        )
    }
}

impl Drop for RestBackend {
    fn drop(&mut self) {
        for (_, handle) in self.pollers.lock().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Record>> {
        let url = self.inner.table_url(&query.table)?;
        let params = query_params(query);
        let response = self
            .inner
            .send(|| Ok(self.inner.request(Method::GET, url.clone())?.query(&params)))
            .await?;
        Ok(response.json().await?)
    }

    async fn insert(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.inner.table_url(table)?;
        let body = Value::Array(records.into_iter().map(Value::Object).collect());
        let response = self
            .inner
            .send_once(|| {
                Ok(self
                    .inner
                    .request(Method::POST, url.clone())?
                    .header("Prefer", "return=representation")
                    .json(&body))
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn update(&self, table: &str, id: RowId, fields: Record) -> Result<Record> {
        let url = self.inner.table_url(table)?;
        let filter = format!("eq.{id}");
        let response = self
            .inner
            .send(|| {
                Ok(self
                    .inner
                    .request(Method::PATCH, url.clone())?
                    .query(&[("id", filter.as_str())])
                    .header("Prefer", "return=representation")
                    .json(&fields))
            })
            .await?;
        let mut rows: Vec<Record> = response.json().await?;
        if rows.is_empty() {
            return Err(HoldbackError::RowNotFound {
                table: table.to_string(),
                id,
            });
        }
        Ok(rows.swap_remove(0))
    }

    async fn delete(&self, table: &str, id: RowId) -> Result<()> {
        let url = self.inner.table_url(table)?;
        let filter = format!("eq.{id}");
        self.inner
            .send(|| {
                Ok(self
                    .inner
                    .request(Method::DELETE, url.clone())?
                    .query(&[("id", filter.as_str())]))
            })
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<Subscription> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::unbounded_channel();
        let poller = Poller {
            client: self.inner.clone(),
            detector: ChangeDetector::new(topics.to_vec()),
            interval: self.poll_interval,
            sender,
        };
        let handle = tokio::spawn(poller.run());
        self.pollers.lock().insert(id, handle);
        Ok(Subscription::new(id, receiver))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(handle) = self.pollers.lock().remove(&id) {
            handle.abort();
        }
    }
}

/// Snapshot used to detect table changes between polls
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    latest: Option<String>,
    newest_id: Option<RowId>,
    count: Option<u64>,
}

impl Fingerprint {
    /// Classify the change from `previous` to `self`, if any.
    fn change_since(&self, previous: &Fingerprint) -> Option<ChangeKind> {
        if self == previous {
            return None;
        }
        match (previous.count, self.count) {
            (Some(before), Some(after)) if after > before => Some(ChangeKind::Insert),
            (Some(before), Some(after)) if after < before => Some(ChangeKind::Delete),
            _ => Some(ChangeKind::Update),
        }
    }
}

/// Turns successive fingerprints of the subscribed tables into notifications.
///
/// A fingerprint cannot tell how many rows changed or who changed them, so
/// every notification is coalesced: it stands for everything that happened
/// to the table since the previous poll.
struct ChangeDetector {
    topics: Vec<Topic>,
    seen: HashMap<String, Fingerprint>,
}

impl ChangeDetector {
    fn new(topics: Vec<Topic>) -> Self {
        Self {
            topics,
            seen: HashMap::new(),
        }
    }

    /// Subscribed tables, each once
    fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.topics.iter().map(|t| t.table.clone()).collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    /// Record the latest fingerprint of `table` and return the notification
    /// it warrants. The first fingerprint of a table only sets the baseline.
    fn observe(&mut self, table: &str, current: Fingerprint) -> Option<ChangeEvent> {
        let previous = self.seen.insert(table.to_string(), current.clone())?;
        let kind = current.change_since(&previous)?;
        let event = ChangeEvent {
            table: table.to_string(),
            kind,
            row_id: match kind {
                ChangeKind::Delete => None,
                _ => current.newest_id,
            },
            record: None,
            coalesced: true,
        };
        self.topics.iter().any(|t| t.matches(&event)).then_some(event)
    }
}

struct Poller {
    client: RestClient,
    detector: ChangeDetector,
    interval: Duration,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

impl Poller {
    async fn run(mut self) {
        let tables = self.detector.tables();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            for table in &tables {
                let current = match self.client.fingerprint(table).await {
                    Ok(fp) => fp,
                    Err(e) => {
                        tracing::warn!("change poll of {table} failed: {e}");
                        continue;
                    }
                };
                let Some(event) = self.detector.observe(table, current) else {
                    continue;
                };
                if self.sender.send(event).is_err() {
                    return;
                }
            }
        }
    }
}

/// Translate a query into PostgREST parameters
fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for filter in &query.filters {
        let value = match &filter.value {
            Value::String(s) => s.clone(),
            Value::Null => "null".to_string(),
            other => other.to_string(),
        };
        let op = if filter.value.is_null() { "is" } else { "eq" };
        params.push((filter.column.clone(), format!("{op}.{value}")));
    }
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| {
                format!(
                    "{}.{}",
                    o.column,
                    if o.ascending { "asc" } else { "desc" }
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// Total row count from a `Content-Range` header (`0-24/3573` or `*/0`)
fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// Pull the `message` out of a PostgREST error body, falling back to the body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
