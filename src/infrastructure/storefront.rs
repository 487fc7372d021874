//! # HTTP Storefront Adapter
//!
//! [`BrowserSession`] over a BigCommerce-style storefront: pages are fetched
//! with a cookie-keeping HTTP client and parsed with configurable selectors,
//! variant selection goes through the product-attributes endpoint and the
//! cart oracle through the cart-add endpoint.
//!
//! With `headless = false` every navigation and cart action is logged at
//! `info`, so a run can be followed step by step.

#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::crawling::session::{
    BrowserSession, CartOracle, CartVerdict, ListingPage, SessionError, SessionFactory, VariantPage,
};
use crate::domain::{Availability, ProductPage, Variant};
use crate::infrastructure::config::{EndpointConfig, StorefrontConfig};
use crate::infrastructure::http_client::{HttpClient, HttpClientConfig, SharedRateLimiter};
use crate::infrastructure::parsing::{ListingParser, ProductPageParser};

// ---- storefront JSON answers ------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct AttributeResponse {
    #[serde(default)]
    data: AttributeData,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AttributeData {
    purchasable: bool,
    instock: bool,
    price: Option<PriceBlock>,
}

impl Default for AttributeData {
    fn default() -> Self {
        Self {
            purchasable: true,
            instock: true,
            price: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PriceBlock {
    without_tax: Option<Money>,
    with_tax: Option<Money>,
}

#[derive(Debug, Deserialize)]
struct Money {
    formatted: String,
}

impl AttributeData {
    fn into_variant_page(self) -> VariantPage {
        let availability = if !self.purchasable {
            Availability::Unavailable
        } else if !self.instock {
            Availability::OutOfStock
        } else {
            Availability::Purchasable
        };
        let price = self
            .price
            .and_then(|p| p.without_tax.or(p.with_tax))
            .map(|m| m.formatted);
        VariantPage { availability, price }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CartAddResponse {
    #[serde(default)]
    data: CartAddData,
}

#[derive(Debug, Default, Deserialize)]
struct CartAddData {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CartSummary {
    id: String,
}

/// `?page=N` form of a listing URL; page 1 is the listing itself
pub fn listing_page_url(listing_url: &str, page: u32) -> Result<String, SessionError> {
    if page <= 1 {
        return Ok(listing_url.to_string());
    }
    let mut url =
        Url::parse(listing_url).map_err(|e| SessionError::InvalidInput(format!("Bad listing URL {listing_url}: {e}")))?;
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("page", &page.to_string());
    Ok(url.to_string())
}

/// Form fields that select a variant on the product form
fn variant_form(variant: &Variant, product_id: &str) -> Vec<(String, String)> {
    let mut form = vec![
        ("action".to_string(), "add".to_string()),
        ("product_id".to_string(), product_id.to_string()),
    ];
    form.extend(variant.selections.iter().map(|s| (s.field.clone(), s.value.clone())));
    form
}

// ---- session ------------------------------------------------------------------

/// One storefront session: own cookies, own cart
#[derive(Debug)]
pub struct HttpStorefrontSession {
    id: String,
    client: HttpClient,
    base_url: Url,
    endpoints: EndpointConfig,
    listing_parser: Arc<ListingParser>,
    product_parser: Arc<ProductPageParser>,
    headless: bool,
}

impl HttpStorefrontSession {
    fn action(&self, message: &str) {
        if self.headless {
            debug!(session = %self.id, "{}", message);
        } else {
            info!(session = %self.id, "👁️ {}", message);
        }
    }

    fn endpoint(&self, path: &str) -> Result<String, SessionError> {
        self.base_url
            .join(path)
            .map(|u| u.to_string())
            .map_err(|e| SessionError::InvalidInput(format!("Bad endpoint {path}: {e}")))
    }

    fn product_id<'a>(variant: &'a Variant) -> Result<&'a str, SessionError> {
        variant.product.product_id.as_deref().ok_or_else(|| {
            SessionError::Extraction(format!("{} has no storefront product id", variant.product.url))
        })
    }
}

#[async_trait]
impl CartOracle for HttpStorefrontSession {
    async fn try_add_to_cart(&mut self, variant: &Variant, quantity: u32) -> Result<CartVerdict, SessionError> {
        let product_id = Self::product_id(variant)?;
        let mut form = variant_form(variant, product_id);
        form.push(("qty[]".to_string(), quantity.to_string()));

        self.action(&format!("Add {} × {} to cart", quantity, variant.key()));
        let url = self.endpoint(&self.endpoints.cart_add)?;
        let response: CartAddResponse = self.client.post_form(&url, &form).await?;

        Ok(match response.data.error {
            Some(reason) => CartVerdict::Rejected { reason },
            None => CartVerdict::Accepted,
        })
    }

    async fn clear_cart(&mut self) -> Result<(), SessionError> {
        let url = self.endpoint(&self.endpoints.cart_api)?;
        let carts: Vec<CartSummary> = self.client.get_json(&url).await?;
        for cart in carts {
            self.action(&format!("Empty cart {}", cart.id));
            self.client
                .delete(&format!("{}/{}", url.trim_end_matches('/'), cart.id))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for HttpStorefrontSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn open_listing(&mut self, listing_url: &str, page: u32) -> Result<ListingPage, SessionError> {
        let url = listing_page_url(listing_url, page)?;
        self.action(&format!("Open listing {}", url));
        let html = self.client.get_text(&url).await?;
        self.listing_parser
            .parse(&html, &url)
            .map_err(|e| SessionError::Extraction(e.to_string()))
    }

    async fn open_product(&mut self, url: &str) -> Result<ProductPage, SessionError> {
        self.action(&format!("Open product {}", url));
        let html = self.client.get_text(url).await?;
        self.product_parser
            .parse(&html, url)
            .map_err(|e| SessionError::Extraction(e.to_string()))
    }

    async fn open_variant(&mut self, variant: &Variant) -> Result<VariantPage, SessionError> {
        self.action(&format!("Select {}", variant.key()));
        let Some(product_id) = variant.product.product_id.as_deref() else {
            if !variant.selections.is_empty() {
                return Err(SessionError::Extraction(format!(
                    "{} has attributes but no storefront product id",
                    variant.product.url
                )));
            }
            let page = self.open_product(variant.url()).await?;
            return Ok(VariantPage {
                availability: page.availability,
                price: page.product.price,
            });
        };

        let path = format!("{}/{}", self.endpoints.product_attributes.trim_end_matches('/'), product_id);
        let url = self.endpoint(&path)?;
        let response: AttributeResponse = self.client.post_form(&url, &variant_form(variant, product_id)).await?;
        Ok(response.data.into_variant_page())
    }
}

// ---- factory ------------------------------------------------------------------

/// Builds isolated sessions that share one rate limiter and the parsers
pub struct HttpStorefrontFactory {
    http: HttpClientConfig,
    rate_limiter: SharedRateLimiter,
    base_url: Url,
    endpoints: EndpointConfig,
    listing_parser: Arc<ListingParser>,
    product_parser: Arc<ProductPageParser>,
    headless: bool,
    created: AtomicU64,
}

impl HttpStorefrontFactory {
    pub fn new(config: &StorefrontConfig, headless: bool) -> Result<Self> {
        let http = HttpClientConfig::from(config);
        let rate_limiter = http.rate_limiter().context("Invalid storefront rate limit")?;
        Ok(Self {
            rate_limiter,
            http,
            base_url: Url::parse(&config.base_url).context("Invalid storefront base URL")?,
            endpoints: config.endpoints.clone(),
            listing_parser: Arc::new(
                ListingParser::with_config(&config.selectors).context("Invalid listing selectors")?,
            ),
            product_parser: Arc::new(
                ProductPageParser::with_config(&config.selectors).context("Invalid product selectors")?,
            ),
            headless,
            created: AtomicU64::new(0),
        })
    }
}

impl std::fmt::Debug for HttpStorefrontFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStorefrontFactory")
            .field("base_url", &self.base_url.as_str())
            .field("headless", &self.headless)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionFactory for HttpStorefrontFactory {
    async fn create_session(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let n = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        let session = HttpStorefrontSession {
            id: format!("http-{n}"),
            client: HttpClient::new(self.http.clone(), Arc::clone(&self.rate_limiter))?,
            base_url: self.base_url.clone(),
            endpoints: self.endpoints.clone(),
            listing_parser: Arc::clone(&self.listing_parser),
            product_parser: Arc::clone(&self.product_parser),
            headless: self.headless,
        };
        info!(session = %session.id, "🌐 Storefront session created");
        Ok(Box::new(session))
    }
}
