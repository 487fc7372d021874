//! 프로버 성능 벤치마크
//!
//! Binary search against an in-memory oracle, and a full worker pool run
//! over the scripted storefront.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use inventory_prober_lib::application::InventoryRun;
use inventory_prober_lib::crawling::{CartOracle, CartVerdict, InventoryProber, SessionError};
use inventory_prober_lib::domain::{Product, Variant};
use inventory_prober_lib::infrastructure::retry_manager::{RetryExecutor, RetryPolicy};
use inventory_prober_lib::test_utils::{ScriptedStorefront, sized_product, test_config};
use tokio_util::sync::CancellationToken;

/// Accepts any cart total up to `stock`
struct CountingOracle {
    stock: u32,
    cart: u32,
}

#[async_trait]
impl CartOracle for CountingOracle {
    async fn try_add_to_cart(&mut self, _variant: &Variant, quantity: u32) -> Result<CartVerdict, SessionError> {
        if self.cart + quantity <= self.stock {
            self.cart += quantity;
            Ok(CartVerdict::Accepted)
        } else {
            Ok(CartVerdict::Rejected {
                reason: "not enough stock".to_string(),
            })
        }
    }

    async fn clear_cart(&mut self) -> Result<(), SessionError> {
        self.cart = 0;
        Ok(())
    }
}

fn probe_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let variant = Variant::new(Arc::new(Product::new("ARW-1", "Arrow X", "https://shop.test/arw-1/")), vec![]);
    let retry = RetryExecutor::new(RetryPolicy::immediate(1), Duration::from_secs(5));

    let mut group = c.benchmark_group("probe_search");
    for ceiling in [100_u32, 1_000, 10_000] {
        let prober = InventoryProber::new(ceiling, retry.clone());
        group.bench_with_input(BenchmarkId::from_parameter(ceiling), &ceiling, |b, &ceiling| {
            b.to_async(&rt).iter(|| async {
                let mut oracle = CountingOracle {
                    stock: ceiling / 3,
                    cart: 0,
                };
                black_box(prober.probe(&mut oracle, &variant).await.unwrap())
            });
        });
    }
    group.finish();
}

fn full_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let sizes: Vec<String> = (1..=40).map(|i| format!("{i}")).collect();
    let sizes: Vec<&str> = sizes.iter().map(String::as_str).collect();
    let (page, variants) = sized_product("ARW-1", "Arrow X", &sizes);
    let listing = "https://shop.test/arrows/";

    let mut storefront = ScriptedStorefront::new()
        .with_listing(listing, &[&[page.product.url.as_str()]])
        .with_product(page);
    for (i, variant) in variants.iter().enumerate() {
        storefront = storefront.with_stock(variant.key(), u32::try_from(i * 3).unwrap_or(0));
    }

    let mut group = c.benchmark_group("full_run");
    group.sample_size(20);
    for workers in [1_usize, 4] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async {
                let dir = tempfile::tempdir().unwrap();
                let mut config = test_config(dir.path(), &[listing]);
                config.crawl.concurrency = workers;
                let report = InventoryRun::new(config, Arc::new(storefront.clone()))
                    .execute(&CancellationToken::new())
                    .await
                    .unwrap();
                black_box(report.records.len())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, probe_search, full_run);
criterion_main!(benches);
