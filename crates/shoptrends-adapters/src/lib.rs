//! Raw offer shapes, the normalizer, and feed source adapters.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde_json::{Map as JsonMap, Value as JsonValue};
use shoptrends_core::{identity_key, parse_timestamp, CategoryFallback, Identifiable, OfferDraft};
use shoptrends_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shoptrends-adapters";

pub const TIKTOK_SEARCH_URL: &str = "https://www.tiktok.com/search";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("feed is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("feed has no items array")]
    MissingItems,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Field names a raw shape may use for each canonical field, in priority order.
#[derive(Debug)]
pub struct FieldAliases {
    pub source: &'static [&'static str],
    pub id: &'static [&'static str],
    pub title: &'static [&'static str],
    pub image: &'static [&'static str],
    pub url: &'static [&'static str],
    pub price: &'static [&'static str],
    pub promo_price: &'static [&'static str],
    /// Pre-discount price for shapes whose `price` is the current price.
    pub list_price: &'static [&'static str],
    pub category_slug: &'static [&'static str],
    pub category_name: &'static [&'static str],
    pub tiktok_url: &'static [&'static str],
}

const CANONICAL_ALIASES: FieldAliases = FieldAliases {
    source: &["source"],
    id: &["sourceId", "source_id"],
    title: &["title", "name"],
    image: &["imageUrl", "image_url", "image"],
    url: &["productUrl", "url", "link"],
    price: &["price"],
    promo_price: &["promoPrice", "promo_price"],
    list_price: &[],
    category_slug: &["categorySlug", "category_slug"],
    category_name: &["categoryName", "category_name"],
    tiktok_url: &["tiktokUrl", "tiktok_url"],
};

const SHOPEE_AFFILIATE_ALIASES: FieldAliases = FieldAliases {
    source: &["source"],
    id: &["itemId", "itemid", "item_id"],
    title: &["itemName", "name", "item_name", "title"],
    image: &["imageUrl", "image", "image_url"],
    url: &["productUrl", "offerLink", "link"],
    price: &["price"],
    promo_price: &["promoPrice", "promo_price"],
    list_price: &[],
    category_slug: &["categorySlug"],
    category_name: &["categoryName"],
    tiktok_url: &["tiktokUrl"],
};

const STOREFRONT_ALIASES: FieldAliases = FieldAliases {
    source: &["source"],
    id: &["id", "product_id"],
    title: &["title", "name"],
    image: &["image", "image_url", "imageUrl", "thumb"],
    url: &["affiliate_url", "url", "link", "productUrl"],
    price: &["price"],
    promo_price: &["promoPrice", "promo_price"],
    list_price: &["price_original"],
    category_slug: &["category_slug", "categorySlug"],
    category_name: &["category", "cat", "categoryName"],
    tiktok_url: &["tiktokUrl"],
};

const SHOPEE_MARKERS: &[&str] = &["itemId", "itemid", "item_id", "itemName", "offerLink"];

/// A raw feed record resolved to the upstream shape it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawOffer<'a> {
    /// Published catalog records (`source` + `sourceId`).
    Canonical(&'a JsonMap<String, JsonValue>),
    /// Affiliate open-API offers (`itemId`, `itemName`, `offerLink`).
    ShopeeAffiliate(&'a JsonMap<String, JsonValue>),
    /// Storefront exports (`id`/`product_id`, `price_original`).
    Storefront(&'a JsonMap<String, JsonValue>),
}

impl<'a> RawOffer<'a> {
    /// Non-object records have no shape and are skipped.
    pub fn classify(raw: &'a JsonValue) -> Option<Self> {
        let map = raw.as_object()?;
        let has_any = |keys: &[&str]| keys.iter().any(|k| map.get(*k).is_some_and(|v| !v.is_null()));
        let has_text = |keys: &[&str]| keys.iter().any(|k| map.get(*k).and_then(coerce_text).is_some());

        Some(if has_text(CANONICAL_ALIASES.id) {
            Self::Canonical(map)
        } else if has_any(SHOPEE_MARKERS) {
            Self::ShopeeAffiliate(map)
        } else {
            Self::Storefront(map)
        })
    }

    pub fn aliases(&self) -> &'static FieldAliases {
        match self {
            Self::Canonical(_) => &CANONICAL_ALIASES,
            Self::ShopeeAffiliate(_) => &SHOPEE_AFFILIATE_ALIASES,
            Self::Storefront(_) => &STOREFRONT_ALIASES,
        }
    }

    fn fields(&self) -> &'a JsonMap<String, JsonValue> {
        match self {
            Self::Canonical(map) | Self::ShopeeAffiliate(map) | Self::Storefront(map) => map,
        }
    }

    fn text(&self, keys: &[&str]) -> Option<String> {
        let map = self.fields();
        keys.iter().filter_map(|k| map.get(*k)).find_map(coerce_text)
    }

    fn raw_str(&self, keys: &[&str]) -> Option<&'a str> {
        let map = self.fields();
        keys.iter()
            .filter_map(|k| map.get(*k))
            .filter_map(JsonValue::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    fn number(&self, keys: &[&str]) -> Option<f64> {
        let map = self.fields();
        keys.iter().filter_map(|k| map.get(*k)).find_map(coerce_number)
    }

    /// `(price, promo_price)` with negatives clamped and zero promos dropped.
    fn prices(&self) -> (f64, Option<f64>) {
        let aliases = self.aliases();
        let price = self.number(aliases.price).unwrap_or(0.0).max(0.0);
        let promo = self.number(aliases.promo_price).filter(|p| *p > 0.0);

        match self.number(aliases.list_price) {
            Some(list) if list > price && price > 0.0 => (list, promo.or(Some(price))),
            _ => (price, promo),
        }
    }

    /// Resolve this record into the canonical draft, or `None` when it has no
    /// usable identity or title.
    pub fn to_draft(&self, fallback: Option<&CategoryFallback>) -> Option<OfferDraft> {
        let key = identity_key(self);
        let aliases = self.aliases();
        let title = self.text(aliases.title).unwrap_or_default();
        if !key.is_valid() || title.is_empty() {
            return None;
        }

        let (price, promo_price) = self.prices();
        Some(OfferDraft {
            source: key.source().to_string(),
            source_id: key.id().to_string(),
            title,
            image_url: self.text(aliases.image).unwrap_or_default(),
            category_slug: self
                .text(aliases.category_slug)
                .or_else(|| fallback.map(|c| c.slug.clone()))
                .unwrap_or_default(),
            category_name: self
                .text(aliases.category_name)
                .or_else(|| fallback.map(|c| c.name.clone()))
                .unwrap_or_default(),
            product_url: self.text(aliases.url).unwrap_or_default(),
            price,
            promo_price,
            tiktok_url: self.text(aliases.tiktok_url),
        })
    }
}

impl Identifiable for RawOffer<'_> {
    fn source_tag(&self) -> Option<&str> {
        self.raw_str(self.aliases().source)
    }

    fn local_id(&self) -> Option<String> {
        self.text(self.aliases().id)
    }

    fn identity_url(&self) -> Option<&str> {
        self.raw_str(self.aliases().url)
    }

    fn identity_title(&self) -> Option<&str> {
        self.raw_str(self.aliases().title)
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn coerce_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_number(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<f64>()
                .ok()
                .or_else(|| s.replace(',', ".").parse::<f64>().ok())
        }
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// Normalize one raw record. Pure; rejected records yield `None`.
pub fn normalize(raw: &JsonValue, fallback: Option<&CategoryFallback>) -> Option<OfferDraft> {
    RawOffer::classify(raw)?.to_draft(fallback)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub drafts: Vec<OfferDraft>,
    pub skipped: usize,
}

impl NormalizedBatch {
    pub fn extend(&mut self, other: NormalizedBatch) {
        self.drafts.extend(other.drafts);
        self.skipped += other.skipped;
    }
}

pub fn normalize_batch(raw: &[JsonValue], fallback: Option<&CategoryFallback>) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for record in raw {
        match normalize(record, fallback) {
            Some(draft) => batch.drafts.push(draft),
            None => batch.skipped += 1,
        }
    }
    batch
}

/// Search link used when an offer has no curated TikTok video.
pub fn tiktok_search_url(title: &str) -> String {
    let title = title.trim();
    let title = if title.is_empty() { "produto shopee" } else { title };
    let query = format!("{title} review unboxing");
    Url::parse_with_params(TIKTOK_SEARCH_URL, &[("q", query.as_str())])
        .map(|url| url.to_string())
        .unwrap_or_else(|_| TIKTOK_SEARCH_URL.to_string())
}

/// Decoded feed document, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeed {
    pub updated_at: Option<DateTime<Utc>>,
    pub items: Vec<JsonValue>,
}

/// Decode a feed body: either a bare array of records or `{ updatedAt?, items }`.
pub fn parse_feed(bytes: &[u8]) -> Result<RawFeed, AdapterError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(AdapterError::InvalidJson)?;
    match value {
        JsonValue::Array(items) => Ok(RawFeed {
            updated_at: None,
            items,
        }),
        JsonValue::Object(mut map) => {
            let Some(JsonValue::Array(items)) = map.remove("items") else {
                return Err(AdapterError::MissingItems);
            };
            let updated_at = map
                .get("updatedAt")
                .and_then(JsonValue::as_str)
                .and_then(parse_timestamp);
            Ok(RawFeed { updated_at, items })
        }
        _ => Err(AdapterError::MissingItems),
    }
}

/// Where raw offers come from: a published feed URL or a local export.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn location(&self) -> &str;

    async fn fetch_feed(&self, run_id: Uuid) -> Result<RawFeed, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl HttpFeedSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    fn location(&self) -> &str {
        &self.url
    }

    async fn fetch_feed(&self, run_id: Uuid) -> Result<RawFeed, AdapterError> {
        let response = self.http.fetch_bytes(run_id, &self.url).await?;
        debug!(%run_id, status = %response.status, url = %response.final_url, bytes = response.body.len(), "feed fetched");
        parse_feed(&response.body)
    }
}

#[derive(Debug, Clone)]
pub struct FileFeedSource {
    path: PathBuf,
    label: String,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path.display().to_string();
        Self { path, label }
    }
}

#[async_trait]
impl FeedSource for FileFeedSource {
    fn location(&self) -> &str {
        &self.label
    }

    async fn fetch_feed(&self, run_id: Uuid) -> Result<RawFeed, AdapterError> {
        let bytes = fs::read(&self.path).await.map_err(|source| AdapterError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(%run_id, path = %self.label, bytes = bytes.len(), "feed read");
        parse_feed(&bytes)
    }
}

/// `http(s)://` locations are fetched over the network, anything else is a path.
pub fn feed_source_for(location: &str, http: Arc<HttpFetcher>) -> Arc<dyn FeedSource> {
    let lower = location.trim().to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Arc::new(HttpFeedSource::new(http, location.trim()))
    } else {
        Arc::new(FileFeedSource::new(location.trim()))
    }
}
