//! Snapshot persistence + HTTP fetch utilities for Shop Trends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use shoptrends_core::{Item, Snapshot};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shoptrends-storage";

/// Query parameter appended to every feed request so intermediaries never
/// answer from cache.
pub const CACHE_BUST_PARAM: &str = "_ts";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {path} is malformed: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable home of the canonical snapshot. Reads happen at cycle start, writes
/// replace the whole snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Snapshot, StorageError>;

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;
}

/// Decode a persisted snapshot, dropping individual items that no longer
/// decode instead of rejecting the file. A bare JSON array is read as the
/// item list of a snapshot without `updatedAt`; an object must carry an
/// `items` array.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, serde_json::Error> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let (mut snapshot, raw_items) = match value {
        JsonValue::Array(items) => (Snapshot::empty(), items),
        JsonValue::Object(mut map) => {
            let items = map.remove("items").unwrap_or(JsonValue::Null);
            let items: Vec<JsonValue> = serde_json::from_value(items)?;
            let snapshot: Snapshot = serde_json::from_value(JsonValue::Object(map))?;
            (snapshot, items)
        }
        other => (serde_json::from_value(other)?, Vec::new()),
    };

    snapshot.items = raw_items
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<Item>(raw) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(%err, "dropping undecodable snapshot item");
                None
            }
        })
        .collect();
    Ok(snapshot)
}

/// JSON file store with temp-file + atomic rename writes.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::io("creating snapshot directory", &parent, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StorageError::io("opening temp snapshot file", &temp_path, e))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io("writing temp snapshot file", &temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io("renaming temp snapshot onto", &self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot yet; starting empty");
                return Ok(Snapshot::empty());
            }
            Err(err) => return Err(StorageError::io("reading snapshot", &self.path, err)),
        };
        decode_snapshot(&bytes).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        self.write_atomic(&bytes).await
    }
}

/// In-process store for ephemeral clients and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl MemoryStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        *self.snapshot.lock().await = snapshot.clone();
        Ok(())
    }
}

/// Whether a failed feed request is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// The feed host being overloaded or down is transient; any other
    /// non-success answer is final for this cycle.
    pub fn for_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 | 500..=599 => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Capped exponential backoff between feed fetch attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    /// `attempt` counts failures so far; `None` once the budget is spent or
    /// the failure is final.
    pub fn next_delay(&self, attempt: usize, disposition: RetryDisposition) -> Option<Duration> {
        if disposition == RetryDisposition::NonRetryable || attempt >= self.max_retries {
            return None;
        }
        let doublings = u32::try_from(attempt).unwrap_or(u32::MAX).min(16);
        Some(self.base_delay.saturating_mul(1u32 << doublings).min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid feed url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Append the cache-busting stamp to `url`, keeping any existing query.
pub fn cache_busted_url(url: &str, stamp: i64) -> Result<Url, FetchError> {
    let mut parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    parsed
        .query_pairs_mut()
        .append_pair(CACHE_BUST_PARAM, &stamp.to_string());
    Ok(parsed)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` bypassing transport caches, retrying transient failures.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let target = cache_busted_url(url, Utc::now().timestamp_millis())?;
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(target).instrument(span).await
    }

    async fn fetch_with_retries(&self, target: Url) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let resp_result = self
                .client
                .get(target.clone())
                .header(CACHE_CONTROL, "no-cache, no-store")
                .header(PRAGMA, "no-cache")
                .send()
                .await;

            let (failure, disposition) = match resp_result {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (failure, RetryDisposition::for_status(status))
                }
                Err(err) => {
                    let disposition = RetryDisposition::for_error(&err);
                    (FetchError::Request(err), disposition)
                }
            };

            let Some(delay) = self.backoff.next_delay(attempt, disposition) else {
                return Err(failure);
            };
            warn!(attempt, error = %failure, ?delay, "retrying feed fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
