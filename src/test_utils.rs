//! Test utilities for the inventory prober
//!
//! [`ScriptedStorefront`] is an in-memory storefront that implements
//! [`SessionFactory`]: listings, product pages and per-variant stock are
//! scripted up front, and failures (session crashes, flaky or dead oracles,
//! broken product pages) can be injected per variant or URL. Every session
//! keeps its own cart, so a probe that forgets to clear it is caught.

#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::crawling::expander::AttributeExpander;
use crate::crawling::session::{
    BrowserSession, CartOracle, CartVerdict, ListingPage, SessionError, SessionFactory, VariantPage,
};
use crate::domain::{
    AttributeChoice, AttributeSlot, Availability, Product, ProductPage, Variant, VariantKey,
};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::retry_manager::RetryPolicy;

#[derive(Debug, Default)]
struct Script {
    /// Listing URL → product URLs per page
    listings: HashMap<String, Vec<Vec<String>>>,
    products: HashMap<String, ProductPage>,
    stock: HashMap<VariantKey, u32>,
    availability: HashMap<VariantKey, Availability>,
    /// Remaining `open_variant` calls that report a lost session
    crashes: HashMap<VariantKey, u32>,
    /// Remaining add-to-cart calls that fail with a network error
    flaky_oracle: HashMap<VariantKey, u32>,
    dead_oracle: HashSet<VariantKey>,
    /// Remaining cart clears that fail with a network error
    failing_clears: u32,
    failing_products: HashSet<String>,
    oracle_delay: Option<Duration>,
}

/// Scripted in-memory storefront; clones share the same script and counters
#[derive(Debug, Clone, Default)]
pub struct ScriptedStorefront {
    script: Arc<Mutex<Script>>,
    oracle_calls: Arc<AtomicU64>,
    sessions_created: Arc<AtomicU64>,
    product_fetches: Arc<AtomicU64>,
}

impl ScriptedStorefront {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Listing with one entry of product URLs per page
    #[must_use]
    pub fn with_listing(self, url: &str, pages: &[&[&str]]) -> Self {
        let pages = pages
            .iter()
            .map(|page| page.iter().map(|u| (*u).to_string()).collect())
            .collect();
        self.script().listings.insert(url.to_string(), pages);
        self
    }

    #[must_use]
    pub fn with_product(self, page: ProductPage) -> Self {
        self.script().products.insert(page.product.url.clone(), page);
        self
    }

    #[must_use]
    pub fn with_stock(self, key: VariantKey, quantity: u32) -> Self {
        self.set_stock(key, quantity);
        self
    }

    /// Changes stock between runs
    pub fn set_stock(&self, key: VariantKey, quantity: u32) {
        self.script().stock.insert(key, quantity);
    }

    #[must_use]
    pub fn with_availability(self, key: VariantKey, availability: Availability) -> Self {
        self.script().availability.insert(key, availability);
        self
    }

    /// The next `times` selections of the variant report a lost session
    #[must_use]
    pub fn crash_session_on(self, key: VariantKey, times: u32) -> Self {
        self.script().crashes.insert(key, times);
        self
    }

    /// The next `times` add-to-cart calls for the variant fail transiently
    #[must_use]
    pub fn flaky_oracle(self, key: VariantKey, times: u32) -> Self {
        self.script().flaky_oracle.insert(key, times);
        self
    }

    /// Every add-to-cart call for the variant fails transiently
    #[must_use]
    pub fn always_fail_oracle(self, key: VariantKey) -> Self {
        self.script().dead_oracle.insert(key);
        self
    }

    /// The next `times` cart clears fail transiently, on any session
    #[must_use]
    pub fn fail_cart_clears(self, times: u32) -> Self {
        self.script().failing_clears = times;
        self
    }

    pub fn heal_oracle(&self, key: &VariantKey) {
        self.script().dead_oracle.remove(key);
    }

    #[must_use]
    pub fn fail_product(self, url: &str) -> Self {
        self.script().failing_products.insert(url.to_string());
        self
    }

    #[must_use]
    pub fn with_oracle_delay(self, delay: Duration) -> Self {
        self.script().oracle_delay = Some(delay);
        self
    }

    /// Raw add-to-cart calls, retries included
    #[must_use]
    pub fn oracle_calls(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.oracle_calls)
    }

    #[must_use]
    pub fn sessions_created(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sessions_created)
    }

    #[must_use]
    pub fn product_fetches(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.product_fetches)
    }
}

#[async_trait]
impl SessionFactory for ScriptedStorefront {
    async fn create_session(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedSession {
            id: format!("scripted-{n}"),
            storefront: self.clone(),
            cart: HashMap::new(),
        }))
    }
}

/// One scripted session with its own cart
#[derive(Debug)]
pub struct ScriptedSession {
    id: String,
    storefront: ScriptedStorefront,
    cart: HashMap<VariantKey, u32>,
}

#[async_trait]
impl CartOracle for ScriptedSession {
    async fn try_add_to_cart(&mut self, variant: &Variant, quantity: u32) -> Result<CartVerdict, SessionError> {
        let delay = self.storefront.script().oracle_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.storefront.oracle_calls.fetch_add(1, Ordering::SeqCst);

        let key = variant.key();
        let stock = {
            let mut script = self.storefront.script();
            if script.dead_oracle.contains(&key) {
                return Err(SessionError::Network("connection reset".to_string()));
            }
            if let Some(remaining) = script.flaky_oracle.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SessionError::Network("connection reset".to_string()));
                }
            }
            script.stock.get(&key).copied().unwrap_or(0)
        };

        let in_cart = self.cart.entry(key).or_insert(0);
        if in_cart.saturating_add(quantity) <= stock {
            *in_cart += quantity;
            Ok(CartVerdict::Accepted)
        } else {
            Ok(CartVerdict::Rejected {
                reason: format!("Only {} available", stock.saturating_sub(*in_cart)),
            })
        }
    }

    async fn clear_cart(&mut self) -> Result<(), SessionError> {
        {
            let mut script = self.storefront.script();
            if script.failing_clears > 0 {
                script.failing_clears -= 1;
                return Err(SessionError::Network("cart service unavailable".to_string()));
            }
        }
        self.cart.clear();
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn open_listing(&mut self, listing_url: &str, page: u32) -> Result<ListingPage, SessionError> {
        let script = self.storefront.script();
        let pages = script.listings.get(listing_url).ok_or_else(|| SessionError::Http {
            status: 404,
            message: format!("Not Found from {listing_url}"),
        })?;
        let index = usize::try_from(page.saturating_sub(1)).unwrap_or(usize::MAX);
        let product_urls = pages.get(index).cloned().ok_or_else(|| SessionError::Http {
            status: 404,
            message: format!("Not Found from {listing_url}?page={page}"),
        })?;
        Ok(ListingPage {
            total_pages: u32::try_from(pages.len()).unwrap_or(u32::MAX).max(1),
            product_urls,
        })
    }

    async fn open_product(&mut self, url: &str) -> Result<ProductPage, SessionError> {
        self.storefront.product_fetches.fetch_add(1, Ordering::SeqCst);
        let script = self.storefront.script();
        if script.failing_products.contains(url) {
            return Err(SessionError::Extraction(format!("No product title on {url}")));
        }
        script.products.get(url).cloned().ok_or_else(|| SessionError::Http {
            status: 404,
            message: format!("Not Found from {url}"),
        })
    }

    async fn open_variant(&mut self, variant: &Variant) -> Result<VariantPage, SessionError> {
        let key = variant.key();
        let mut script = self.storefront.script();
        if let Some(remaining) = script.crashes.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SessionError::SessionLost(format!("{} crashed", self.id)));
            }
        }
        let page_availability = script
            .products
            .get(variant.url())
            .map_or(Availability::Purchasable, |page| page.availability);
        Ok(VariantPage {
            availability: script.availability.get(&key).copied().unwrap_or(page_availability),
            price: variant.product.price.clone(),
        })
    }
}

/// Product page with a single "Size" slot plus its variants in expansion order
#[must_use]
pub fn sized_product(sku: &str, name: &str, sizes: &[&str]) -> (ProductPage, Vec<Variant>) {
    let product = Product::new(sku, name, format!("https://shop.test/{}/", sku.to_lowercase()))
        .with_brand("Black Eagle")
        .with_product_id(sku)
        .with_price("$10.00")
        .with_description(format!("<p>{name}</p>"));
    let slots = if sizes.is_empty() {
        Vec::new()
    } else {
        vec![AttributeSlot::new(
            "attribute[1]",
            "Size",
            sizes.iter().map(|s| AttributeChoice::new(*s, *s)).collect(),
        )]
    };
    let variants = AttributeExpander::expand(&Arc::new(product.clone()), &slots);
    (
        ProductPage {
            product,
            slots,
            availability: Availability::Purchasable,
        },
        variants,
    )
}

/// Configuration for fast, deterministic runs against a [`ScriptedStorefront`]
#[must_use]
pub fn test_config(state_dir: &Path, listing_urls: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.crawl.listing_urls = listing_urls.iter().map(|u| (*u).to_string()).collect();
    config.crawl.concurrency = 3;
    config.retry = RetryPolicy::immediate(3);
    config.timing.navigation_timeout_seconds = 5;
    config.timing.oracle_timeout_seconds = 5;
    config.timing.flush_timeout_seconds = 5;
    config.timing.shutdown_timeout_seconds = 5;
    config.timing.stats_interval_seconds = 60;
    config.session.state_dir = state_dir.to_path_buf();
    config.session.flush_every_completions = 2;
    config.logging.file_output = false;
    config
}
