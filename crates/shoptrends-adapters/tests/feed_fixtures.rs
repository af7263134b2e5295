use std::path::{Path, PathBuf};

use shoptrends_adapters::{normalize_batch, FeedSource, FileFeedSource, AdapterError};
use shoptrends_core::{fingerprint, CategoryFallback};
use uuid::Uuid;

fn feed_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/feeds")
        .join(name)
}

fn fallback(slug: &str, name: &str) -> CategoryFallback {
    CategoryFallback {
        slug: slug.into(),
        name: name.into(),
    }
}

#[tokio::test]
async fn affiliate_feed_normalizes_and_skips_untitled_offers() {
    let feed = FileFeedSource::new(feed_path("eletronicos.json"))
        .fetch_feed(Uuid::new_v4())
        .await
        .expect("feed");
    assert_eq!(feed.items.len(), 4);

    let category = fallback("eletronicos", "Eletrônicos & Acessórios");
    let batch = normalize_batch(&feed.items, Some(&category));
    assert_eq!(batch.skipped, 1);

    let keys: Vec<String> = batch
        .drafts
        .iter()
        .map(|d| d.identity_key().to_string())
        .collect();
    assert_eq!(
        keys,
        vec![
            "shopee_affiliate:22334455".to_string(),
            "shopee_affiliate:22334456".to_string(),
            format!(
                "shopee_affiliate:{}",
                fingerprint("https://s.shopee.com.br/carregador-20w")
            ),
        ]
    );
    assert!(batch
        .drafts
        .iter()
        .all(|d| d.category_slug == "eletronicos"));
    assert_eq!(batch.drafts[1].promo_price, None);
}

#[tokio::test]
async fn published_snapshot_feed_keeps_curated_links() {
    let feed = FileFeedSource::new(feed_path("published.json"))
        .fetch_feed(Uuid::new_v4())
        .await
        .expect("feed");
    assert!(feed.updated_at.is_some());

    let batch = normalize_batch(&feed.items, None);
    assert_eq!(batch.skipped, 0);
    assert_eq!(batch.drafts.len(), 3);
    assert_eq!(
        batch.drafts[1].tiktok_url.as_deref(),
        Some("https://www.tiktok.com/@casa/video/7312")
    );
    assert_eq!(batch.drafts[0].tiktok_url, None);
    assert_eq!(
        batch.drafts[2].source_id,
        fingerprint("Sem identificador nem link")
    );
}

#[tokio::test]
async fn storefront_export_maps_list_price() {
    let feed = FileFeedSource::new(feed_path("storefront.json"))
        .fetch_feed(Uuid::new_v4())
        .await
        .expect("feed");
    let category = fallback("miniaturas", "Miniaturas de carrinhos");
    let batch = normalize_batch(&feed.items, Some(&category));

    assert_eq!(batch.drafts.len(), 2);
    let skyline = &batch.drafts[0];
    assert_eq!(skyline.source_id, "sf-100");
    assert_eq!(skyline.price, 39.9);
    assert_eq!(skyline.promo_price, Some(29.9));

    let pista = &batch.drafts[1];
    assert_eq!(pista.source_id, "101");
    assert_eq!(pista.price, 119.0);
    assert_eq!(pista.category_name, "Miniaturas de carrinhos");
}

#[tokio::test]
async fn missing_feed_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = FileFeedSource::new(dir.path().join("absent.json"))
        .fetch_feed(Uuid::new_v4())
        .await
        .expect_err("missing");
    assert!(matches!(err, AdapterError::Io { .. }));
}
