//! Core catalog model and identity resolution for Shop Trends.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "shoptrends-core";

/// Provider tag assumed when a record does not name its source.
pub const DEFAULT_SOURCE: &str = "shopee_affiliate";

/// Number of hex chars kept from the content hash used as a fallback id.
pub const FINGERPRINT_LEN: usize = 16;

/// `source:sourceId` pair naming one catalog entry across merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    source: String,
    id: String,
}

impl IdentityKey {
    pub fn new(source: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Keys with an empty id segment are dropped by every downstream stage.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Anything the identity resolver can derive a key for: raw offers and canonical items.
pub trait Identifiable {
    fn source_tag(&self) -> Option<&str>;

    /// First usable source-local id, already stringified.
    fn local_id(&self) -> Option<String>;

    fn identity_url(&self) -> Option<&str>;

    fn identity_title(&self) -> Option<&str>;
}

/// Resolve the identity key of a record. Never fails: a record with no id,
/// URL or title yields a key whose id segment is empty.
pub fn identity_key<R: Identifiable + ?Sized>(record: &R) -> IdentityKey {
    let source = record
        .source_tag()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SOURCE);

    let id = record
        .local_id()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| {
            [record.identity_url(), record.identity_title()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .find(|s| !s.is_empty())
                .map(fingerprint)
        })
        .unwrap_or_default();

    IdentityKey::new(source, id)
}

/// Truncated SHA-256 hex digest, stable across runs and platforms.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Category a feed belongs to, used when a raw record omits its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFallback {
    pub slug: String,
    pub name: String,
}

/// Normalized handoff contract from the normalizer into the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDraft {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub image_url: String,
    pub category_slug: String,
    pub category_name: String,
    pub product_url: String,
    pub price: f64,
    pub promo_price: Option<f64>,
    pub tiktok_url: Option<String>,
}

impl OfferDraft {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.source.clone(), self.source_id.clone())
    }

    pub fn into_item(self, first_seen_at: DateTime<Utc>) -> Item {
        Item {
            source: self.source,
            source_id: self.source_id,
            title: self.title,
            image_url: self.image_url,
            category_slug: self.category_slug,
            category_name: self.category_name,
            product_url: self.product_url,
            price: self.price,
            promo_price: self.promo_price,
            tiktok_url: self.tiktok_url,
            first_seen_at,
        }
    }
}

/// Canonical persisted catalog entry.
///
/// Decoding is lenient so snapshots written by older tooling still load:
/// numeric strings are accepted for prices, `addedAt` for `firstSeenAt`, and
/// the legacy `YYYY-MM-DD HH:MM UTC` timestamp form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default, deserialize_with = "lenient::text")]
    pub source: String,
    #[serde(deserialize_with = "lenient::text")]
    pub source_id: String,
    #[serde(deserialize_with = "lenient::text")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub image_url: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub category_slug: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub category_name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub product_url: String,
    #[serde(default, deserialize_with = "lenient::price")]
    pub price: f64,
    #[serde(default, deserialize_with = "lenient::optional_price")]
    pub promo_price: Option<f64>,
    #[serde(default)]
    pub tiktok_url: Option<String>,
    #[serde(default, alias = "addedAt", deserialize_with = "lenient::timestamp_or_epoch")]
    pub first_seen_at: DateTime<Utc>,
}

impl Item {
    pub fn identity_key(&self) -> IdentityKey {
        identity_key(self)
    }

    /// Valid identity and a non-empty title; anything else is dropped on merge.
    pub fn is_retainable(&self) -> bool {
        self.identity_key().is_valid() && !self.title.trim().is_empty()
    }

    pub fn is_deal(&self) -> bool {
        matches!(self.promo_price, Some(promo) if promo < self.price)
    }

    pub fn effective_price(&self) -> f64 {
        self.promo_price.unwrap_or(self.price)
    }
}

// Canonical items carry an already-resolved id, so no fingerprint fallback.
impl Identifiable for Item {
    fn source_tag(&self) -> Option<&str> {
        Some(&self.source)
    }

    fn local_id(&self) -> Option<String> {
        Some(self.source_id.clone())
    }

    fn identity_url(&self) -> Option<&str> {
        None
    }

    fn identity_title(&self) -> Option<&str> {
        None
    }
}

/// The persisted unit: replaced wholesale at the end of every successful cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, deserialize_with = "lenient::optional_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(updated_at: DateTime<Utc>, items: Vec<Item>) -> Self {
        Self {
            updated_at: Some(updated_at),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Parse the timestamp forms found in feeds and snapshots.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S UTC", "%Y-%m-%d %H:%M UTC"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Number(f64),
        Text(String),
        Flag(bool),
    }

    fn loose<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Loose>, D::Error> {
        Option::<Loose>::deserialize(d)
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match loose(d)? {
            Some(Loose::Text(s)) => s.trim().to_string(),
            Some(Loose::Number(n)) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", n as i64),
            Some(Loose::Number(n)) => n.to_string(),
            Some(Loose::Flag(b)) => b.to_string(),
            None => String::new(),
        })
    }

    fn number(value: Option<Loose>) -> Option<f64> {
        match value? {
            Loose::Number(n) => Some(n),
            Loose::Text(s) => s.trim().parse::<f64>().ok(),
            Loose::Flag(_) => None,
        }
        .filter(|n| n.is_finite())
    }

    pub fn price<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(number(loose(d)?).unwrap_or(0.0).max(0.0))
    }

    pub fn optional_price<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(number(loose(d)?))
    }

    fn timestamp(value: Option<Loose>) -> Option<DateTime<Utc>> {
        match value? {
            Loose::Number(millis) => DateTime::from_timestamp_millis(millis as i64),
            Loose::Text(s) => super::parse_timestamp(&s),
            Loose::Flag(_) => None,
        }
    }

    pub fn optional_timestamp<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(timestamp(loose(d)?))
    }

    pub fn timestamp_or_epoch<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        Ok(timestamp(loose(d)?).unwrap_or_default())
    }
}
