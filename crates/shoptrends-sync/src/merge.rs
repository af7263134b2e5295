//! Merge engine and retention policy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use shoptrends_adapters::{normalize_batch, tiktok_search_url, NormalizedBatch, TIKTOK_SEARCH_URL};
use shoptrends_core::{Item, OfferDraft};
use tracing::debug;

/// Catalog size cap used when nothing else is configured.
pub const DEFAULT_MAX_ITEMS: usize = 800;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    /// Canonical collection, most recently first-seen first.
    pub items: Vec<Item>,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl MergeReport {
    pub fn accepted(&self) -> usize {
        self.added + self.updated
    }

    /// The batch carried no valid offers; callers must keep the previous snapshot.
    pub fn is_noop(&self) -> bool {
        self.accepted() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
}

/// Identity-keyed collection that remembers insertion order.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<Item>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Index previously persisted items. Entries with an invalid key or an
    /// empty title are dropped, and a repeated key keeps its first occurrence.
    pub fn from_items(items: impl IntoIterator<Item = Item>) -> Self {
        let mut catalog = Self::default();
        for item in items {
            if !item.is_retainable() {
                debug!(key = %item.identity_key(), "dropping invalid persisted item");
                continue;
            }
            let key = item.identity_key().to_string();
            if catalog.index.contains_key(&key) {
                debug!(%key, "dropping duplicate persisted item");
                continue;
            }
            catalog.index.insert(key, catalog.entries.len());
            catalog.entries.push(item);
        }
        catalog
    }

    /// Insert a new offer stamped `now`, or replace an existing one while
    /// carrying its `first_seen_at` forward.
    pub fn upsert(&mut self, draft: OfferDraft, now: DateTime<Utc>) -> Upsert {
        let key = draft.identity_key().to_string();
        let (mut item, outcome) = match self.index.get(&key) {
            Some(&pos) => {
                let previous = &self.entries[pos];
                let curated = previous
                    .tiktok_url
                    .clone()
                    .filter(|url| !url.starts_with(TIKTOK_SEARCH_URL));
                let mut item = draft.into_item(previous.first_seen_at);
                if item.tiktok_url.is_none() {
                    item.tiktok_url = curated;
                }
                (item, Upsert::Updated)
            }
            None => (draft.into_item(now), Upsert::Added),
        };

        if item.tiktok_url.is_none() {
            item.tiktok_url = Some(tiktok_search_url(&item.title));
        }

        match outcome {
            Upsert::Updated => self.entries[self.index[&key]] = item,
            Upsert::Added => {
                self.index.insert(key, self.entries.len());
                self.entries.push(item);
            }
        }
        outcome
    }

    /// Most recently first-seen first. The sort is stable, so ties keep
    /// insertion order: previous collection first, then new arrivals.
    pub fn into_recency_order(self) -> Vec<Item> {
        let mut items = self.entries;
        items.sort_by(|a, b| b.first_seen_at.cmp(&a.first_seen_at));
        items
    }
}

/// Merge an already-normalized batch into the previous collection.
pub fn merge_batch(previous: Vec<Item>, batch: NormalizedBatch, now: DateTime<Utc>) -> MergeReport {
    let mut catalog = Catalog::from_items(previous);
    let mut added = 0usize;
    let mut updated = 0usize;

    for draft in batch.drafts {
        match catalog.upsert(draft, now) {
            Upsert::Added => added += 1,
            Upsert::Updated => updated += 1,
        }
    }

    MergeReport {
        items: catalog.into_recency_order(),
        added,
        updated,
        skipped: batch.skipped,
    }
}

/// Normalize `raw_batch` and merge it into `previous`. Malformed records are
/// skipped, never fatal.
pub fn merge(previous: Vec<Item>, raw_batch: &[JsonValue], now: DateTime<Utc>) -> MergeReport {
    merge_batch(previous, normalize_batch(raw_batch, None), now)
}

/// Keep the `max_size` most recently first-seen items of a recency-ordered
/// collection.
pub fn apply_retention(mut items: Vec<Item>, max_size: usize) -> Vec<Item> {
    items.truncate(max_size);
    items
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_items: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
        }
    }
}

impl RetentionPolicy {
    pub fn apply(&self, items: Vec<Item>) -> Vec<Item> {
        apply_retention(items, self.max_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn item(source_id: &str, title: &str, first_seen: i64) -> Item {
        Item {
            source: "x".into(),
            source_id: source_id.into(),
            title: title.into(),
            image_url: String::new(),
            category_slug: String::new(),
            category_name: String::new(),
            product_url: String::new(),
            price: 0.0,
            promo_price: None,
            tiktok_url: None,
            first_seen_at: at(first_seen),
        }
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.source_id.as_str()).collect()
    }

    #[test]
    fn update_keeps_first_seen_and_new_items_lead() {
        let previous = vec![item("1", "A", 100)];
        let raw = vec![
            json!({"source": "x", "sourceId": "1", "title": "A-updated", "price": 10}),
            json!({"source": "x", "sourceId": "2", "title": "B", "price": 5}),
        ];
        let report = merge(previous, &raw, at(200));

        assert_eq!(report.added, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(ids(&report.items), vec!["2", "1"]);
        assert_eq!(report.items[1].title, "A-updated");
        assert_eq!(report.items[1].price, 10.0);
        assert_eq!(report.items[1].first_seen_at, at(100));
        assert!(report.items[0].first_seen_at > at(100));

        let kept = apply_retention(report.items, 1);
        assert_eq!(ids(&kept), vec!["2"]);
    }

    #[test]
    fn zero_retention_empties_collection() {
        let items = vec![item("1", "A", 100), item("2", "B", 50)];
        assert!(apply_retention(items, 0).is_empty());
    }

    #[test]
    fn retention_larger_than_collection_is_a_no_op() {
        let items = vec![item("1", "A", 100)];
        assert_eq!(RetentionPolicy { max_items: 5 }.apply(items.clone()), items);
    }

    #[test]
    fn repeated_key_within_batch_counts_as_update() {
        let raw = vec![
            json!({"source": "x", "sourceId": "1", "title": "first"}),
            json!({"source": "x", "sourceId": "1", "title": "second"}),
        ];
        let report = merge(Vec::new(), &raw, at(10));
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].title, "second");
        assert_eq!((report.added, report.updated), (1, 1));
    }

    #[test]
    fn empty_batch_leaves_previous_untouched() {
        let previous = vec![item("2", "B", 200), item("1", "A", 100)];
        let report = merge(previous.clone(), &[], at(300));
        assert!(report.is_noop());
        assert_eq!(report.items, previous);

        let junk = vec![json!({"title": ""}), json!(5)];
        let report = merge(previous.clone(), &junk, at(300));
        assert!(report.is_noop());
        assert_eq!(report.skipped, 2);
        assert_eq!(report.items, previous);
    }

    #[test]
    fn corrupt_previous_entries_self_heal() {
        let previous = vec![
            item("1", "A", 300),
            item("", "no id", 200),
            item("2", "  ", 150),
            item("1", "A duplicate", 100),
        ];
        let report = merge(previous, &[], at(400));
        assert_eq!(ids(&report.items), vec!["1"]);
        assert_eq!(report.items[0].title, "A");
    }

    #[test]
    fn equal_first_seen_keeps_previous_then_insertion_order() {
        let previous = vec![item("b", "B", 100), item("a", "A", 100)];
        let raw = vec![
            json!({"source": "x", "sourceId": "d", "title": "D"}),
            json!({"source": "x", "sourceId": "c", "title": "C"}),
        ];
        let report = merge(previous, &raw, at(100));
        assert_eq!(ids(&report.items), vec!["b", "a", "d", "c"]);
    }

    #[test]
    fn curated_tiktok_link_survives_update_and_derived_one_is_refreshed() {
        let mut curated = item("1", "A", 100);
        curated.tiktok_url = Some("https://www.tiktok.com/@loja/video/1".into());
        let mut derived = item("2", "Old title", 100);
        derived.tiktok_url = Some(tiktok_search_url("Old title"));

        let raw = vec![
            json!({"source": "x", "sourceId": "1", "title": "A"}),
            json!({"source": "x", "sourceId": "2", "title": "New title"}),
        ];
        let report = merge(vec![curated, derived], &raw, at(200));
        assert_eq!(
            report.items[0].tiktok_url.as_deref(),
            Some("https://www.tiktok.com/@loja/video/1")
        );
        assert_eq!(
            report.items[1].tiktok_url.as_deref(),
            Some(tiktok_search_url("New title").as_str())
        );
    }

    #[test]
    fn new_items_get_search_link_backfilled() {
        let raw = vec![json!({"source": "x", "sourceId": "9", "title": "Caneca"})];
        let report = merge(Vec::new(), &raw, at(1));
        let link = report.items[0].tiktok_url.as_deref().unwrap();
        assert!(link.starts_with(TIKTOK_SEARCH_URL));
    }
}
