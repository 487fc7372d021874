//! End-to-end stock scenarios through the whole run

use std::sync::Arc;
use std::sync::atomic::Ordering;

use inventory_prober_lib::application::categorization::VariantSummary;
use inventory_prober_lib::application::{InventoryRun, RunReport, RunStatus};
use inventory_prober_lib::domain::StockLevel;
use inventory_prober_lib::infrastructure::session_store::{Artifact, SessionStore};
use inventory_prober_lib::test_utils::{ScriptedStorefront, sized_product, test_config};
use tokio_util::sync::CancellationToken;

const LISTING: &str = "https://shop.test/arrows/";

async fn complete_run(dir: &std::path::Path, storefront: &ScriptedStorefront) -> RunReport {
    let report = InventoryRun::new(test_config(dir, &[LISTING]), Arc::new(storefront.clone()))
        .execute(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    report
}

fn summary(name: &str, size: &str) -> VariantSummary {
    VariantSummary {
        product_name: name.to_string(),
        attributes: vec![("Size".to_string(), size.to_string())],
    }
}

#[tokio::test]
async fn arrow_x_sizes_move_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (page, variants) = sized_product("ARW-X", "Arrow X", &["Small", "Large"]);
    let (small, large) = (variants[0].key(), variants[1].key());
    let storefront = ScriptedStorefront::new()
        .with_listing(LISTING, &[&[page.product.url.as_str()]])
        .with_product(page)
        .with_stock(small.clone(), 0)
        .with_stock(large.clone(), 3);

    let first = complete_run(dir.path(), &storefront).await;
    assert!(first.categories.is_empty());
    assert_eq!(first.records[0].current_stock, StockLevel::Exact(0));
    assert_eq!(first.records[1].current_stock, StockLevel::Exact(3));

    storefront.set_stock(small, 2);
    storefront.set_stock(large, 0);
    let second = complete_run(dir.path(), &storefront).await;

    assert!(!second.resumed);
    assert_eq!(second.categories.back_in_stock, vec![summary("Arrow X", "Small")]);
    assert_eq!(second.categories.out_of_stock, vec![summary("Arrow X", "Large")]);
    assert!(second.categories.high_stock.is_empty());
    assert!(second.categories.low_stock.is_empty());

    let small_record = &second.records[0];
    assert_eq!(small_record.current_stock, StockLevel::Exact(2));
    assert_eq!(small_record.previous_stock, Some(StockLevel::Exact(0)));
    assert_eq!(small_record.previous_stock_date, first.records[0].current_stock_date);

    let store = SessionStore::open(dir.path()).await.unwrap();
    assert!(store.exists(Artifact::PreviousResults));
    assert!(store.exists(Artifact::LastRecords));
    assert!(!store.exists(Artifact::Catalog));
}

#[tokio::test]
async fn accepted_ceiling_is_high_stock() {
    let dir = tempfile::tempdir().unwrap();
    let (page, variants) = sized_product("BRD-1", "Broadhead", &[]);
    let storefront = ScriptedStorefront::new()
        .with_listing(LISTING, &[&[page.product.url.as_str()]])
        .with_product(page)
        .with_stock(variants[0].key(), 250);

    let report = complete_run(dir.path(), &storefront).await;

    assert_eq!(report.records[0].current_stock, StockLevel::AtLeast(100));
    assert_eq!(report.categories.high_stock.len(), 1);
    assert_eq!(report.categories.high_stock[0].product_name, "Broadhead");
    assert!(report.categories.high_stock[0].attributes.is_empty());
    // q=1 then q=ceiling, no search
    assert_eq!(storefront.oracle_calls().load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_single_unit_is_zero_after_one_call() {
    let dir = tempfile::tempdir().unwrap();
    let (page, variants) = sized_product("NCK-1", "Nock kit", &["Red"]);
    let storefront = ScriptedStorefront::new()
        .with_listing(LISTING, &[&[page.product.url.as_str()]])
        .with_product(page)
        .with_stock(variants[0].key(), 0);

    let report = complete_run(dir.path(), &storefront).await;

    assert_eq!(report.records[0].current_stock, StockLevel::Exact(0));
    assert_eq!(report.summary.oracle_calls, 1);
    assert_eq!(storefront.oracle_calls().load(Ordering::SeqCst), 1);
    assert!(report.categories.is_empty());
}

#[tokio::test]
async fn single_unit_is_low_stock() {
    let dir = tempfile::tempdir().unwrap();
    let (page, variants) = sized_product("NCK-1", "Nock kit", &["Red", "Blue"]);
    let storefront = ScriptedStorefront::new()
        .with_listing(LISTING, &[&[page.product.url.as_str()]])
        .with_product(page)
        .with_stock(variants[0].key(), 1)
        .with_stock(variants[1].key(), 4);

    let report = complete_run(dir.path(), &storefront).await;

    assert_eq!(report.categories.low_stock, vec![summary("Nock kit", "Red")]);
    assert_eq!(report.records[1].current_stock, StockLevel::Exact(4));
    assert_eq!(report.categories.len(), 1);
}
