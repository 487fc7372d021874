//! # Catalog Discovery
//!
//! Reads every category listing (page 1 first to learn the page count, then
//! `?page=N`) and then every discovered product page, W at a time. Page
//! failures land in the failure tracker and never abort the run. On resume
//! a finished listing phase is reused and only missing product pages are
//! fetched.

#![allow(clippy::uninlined_format_args)]

use std::ops::ControlFlow;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crawling::failures::{FailureKind, FailureTarget};
use crate::crawling::session::{BrowserSession, ListingPage, SessionError, SessionFactory};
use crate::crawling::state::{SessionHandle, StateError};
use crate::domain::ProductPage;
use crate::infrastructure::descriptions::DescriptionWriter;
use crate::infrastructure::retry_manager::{RetryError, RetryExecutor};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Could not open a browser session: {0}")]
    SessionUnavailable(#[source] RetryError<SessionError>),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Outcome of the discovery phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub listing_pages_read: usize,
    pub product_urls: usize,
    pub products_fetched: usize,
    pub page_failures: usize,
    /// The listing phase was reused from an interrupted run
    pub listings_reused: bool,
    pub interrupted: bool,
}

/// Sessions handed out to concurrent page fetches
struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    retry: RetryExecutor,
    idle: Mutex<Vec<Box<dyn BrowserSession>>>,
}

impl SessionPool {
    async fn checkout(&self) -> Result<Box<dyn BrowserSession>, DiscoveryError> {
        if let Some(session) = self.idle.lock().await.pop() {
            return Ok(session);
        }
        self.retry
            .run("create_session", || self.factory.create_session())
            .await
            .map_err(DiscoveryError::SessionUnavailable)
    }

    async fn checkin(&self, session: Box<dyn BrowserSession>) {
        self.idle.lock().await.push(session);
    }
}

/// Failure of one page after retries
struct PageFailure {
    kind: FailureKind,
    reason: String,
    attempts: u32,
}

impl PageFailure {
    fn from_retry(error: &RetryError<SessionError>, attempts: u32) -> Self {
        let kind = match error.inner() {
            SessionError::Extraction(_) | SessionError::InvalidInput(_) => FailureKind::Extraction,
            SessionError::SessionLost(_) => FailureKind::SessionLost,
            _ => FailureKind::Navigation,
        };
        Self {
            kind,
            reason: error.to_string(),
            attempts,
        }
    }
}

/// A page operation that can be replayed on another session
trait PageRequest: Copy + Send + Sync {
    type Output: Send;
    const OPERATION: &'static str;

    fn send<'s>(self, session: &'s mut dyn BrowserSession) -> BoxFuture<'s, Result<Self::Output, SessionError>>
    where
        Self: 's;
}

#[derive(Debug, Clone, Copy)]
struct ListingRequest<'a> {
    url: &'a str,
    page: u32,
}

impl PageRequest for ListingRequest<'_> {
    type Output = ListingPage;
    const OPERATION: &'static str = "open_listing";

    fn send<'s>(self, session: &'s mut dyn BrowserSession) -> BoxFuture<'s, Result<ListingPage, SessionError>>
    where
        Self: 's,
    {
        session.open_listing(self.url, self.page)
    }
}

#[derive(Debug, Clone, Copy)]
struct ProductRequest<'a> {
    url: &'a str,
}

impl PageRequest for ProductRequest<'_> {
    type Output = ProductPage;
    const OPERATION: &'static str = "open_product";

    fn send<'s>(self, session: &'s mut dyn BrowserSession) -> BoxFuture<'s, Result<ProductPage, SessionError>>
    where
        Self: 's,
    {
        session.open_product(self.url)
    }
}

pub struct CatalogDiscovery {
    handle: SessionHandle,
    pool: SessionPool,
    descriptions: DescriptionWriter,
    concurrency: usize,
    /// Attempts per page, session restarts included
    max_page_attempts: u32,
}

impl CatalogDiscovery {
    #[must_use]
    pub fn new(
        handle: SessionHandle,
        factory: Arc<dyn SessionFactory>,
        navigation: RetryExecutor,
        descriptions: DescriptionWriter,
        concurrency: usize,
        max_page_attempts: u32,
    ) -> Self {
        Self {
            handle,
            pool: SessionPool {
                factory,
                retry: navigation,
                idle: Mutex::new(Vec::new()),
            },
            descriptions,
            concurrency: concurrency.max(1),
            max_page_attempts: max_page_attempts.max(1),
        }
    }

    /// Runs both discovery phases
    pub async fn run(&self, listing_urls: &[String], shutdown: &CancellationToken) -> Result<DiscoverySummary, DiscoveryError> {
        let mut summary = DiscoverySummary::default();

        if self.handle.listings_complete().await {
            summary.listings_reused = true;
            info!("♻️ Listing phase already complete, reusing discovered catalog");
        } else {
            self.read_listings(listing_urls, shutdown, &mut summary).await?;
        }

        if !shutdown.is_cancelled() {
            self.read_products(shutdown, &mut summary).await?;
        }

        summary.product_urls = self.handle.catalog().await.discovered_urls.len();
        summary.interrupted = shutdown.is_cancelled();
        self.handle.flush().await?;

        info!(
            listing_pages = summary.listing_pages_read,
            product_urls = summary.product_urls,
            products_fetched = summary.products_fetched,
            page_failures = summary.page_failures,
            interrupted = summary.interrupted,
            "🗂️ Catalog discovery finished"
        );
        Ok(summary)
    }

    async fn read_listings(
        &self,
        listing_urls: &[String],
        shutdown: &CancellationToken,
        summary: &mut DiscoverySummary,
    ) -> Result<(), DiscoveryError> {
        let outcomes: Vec<Result<ListingOutcome, DiscoveryError>> = stream::iter(listing_urls)
            .map(|url| self.read_listing(url, shutdown))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            let outcome = outcome?;
            summary.listing_pages_read += outcome.pages_read;
            summary.page_failures += outcome.failures;
        }

        if !shutdown.is_cancelled() {
            self.handle.mark_listings_complete().await;
            self.handle.flush().await?;
        }
        Ok(())
    }

    /// Reads all pages of one listing and merges its product URLs
    async fn read_listing(&self, listing_url: &str, shutdown: &CancellationToken) -> Result<ListingOutcome, DiscoveryError> {
        let mut outcome = ListingOutcome::default();
        if shutdown.is_cancelled() {
            return Ok(outcome);
        }

        let first = match self.fetch_page(listing_url, 1).await? {
            Ok(page) => page,
            Err(failure) => {
                self.record_failure(
                    FailureTarget::ListingPage {
                        url: listing_url.to_string(),
                    },
                    failure,
                )
                .await;
                outcome.failures += 1;
                return Ok(outcome);
            }
        };
        outcome.pages_read += 1;
        let total_pages = first.total_pages.max(1);
        let mut urls = first.product_urls;

        for page in 2..=total_pages {
            if shutdown.is_cancelled() {
                break;
            }
            match self.fetch_page(listing_url, page).await? {
                Ok(listing) => {
                    outcome.pages_read += 1;
                    urls.extend(listing.product_urls);
                }
                Err(failure) => {
                    let url = format!("{listing_url}?page={page}");
                    self.record_failure(FailureTarget::ListingPage { url }, failure).await;
                    outcome.failures += 1;
                }
            }
        }

        let found = urls.len();
        let added = self.handle.record_listing(listing_url, urls).await;
        self.handle.flush().await?;
        info!(listing = %listing_url, pages = total_pages, found, added, "📄 Listing read");
        Ok(outcome)
    }

    async fn fetch_page(&self, url: &str, page: u32) -> Result<Result<ListingPage, PageFailure>, DiscoveryError> {
        self.with_session(ListingRequest { url, page }).await
    }

    async fn read_products(&self, shutdown: &CancellationToken, summary: &mut DiscoverySummary) -> Result<(), DiscoveryError> {
        let catalog = self.handle.catalog().await;
        let mut pending = Vec::new();
        for url in &catalog.discovered_urls {
            if self.handle.should_fetch_product(url).await {
                pending.push(url.clone());
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        info!(products = pending.len(), "🔍 Fetching product pages");

        let outcomes: Vec<Result<Option<bool>, DiscoveryError>> = stream::iter(pending)
            .map(|url| async move {
                if shutdown.is_cancelled() {
                    return Ok::<_, DiscoveryError>(None);
                }
                let fetched = self.read_product(&url).await?;
                if let Err(e) = self.handle.flush_if_due().await {
                    warn!("⚠️ Periodic flush failed: {e}");
                }
                Ok(Some(fetched))
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome? {
                Some(true) => summary.products_fetched += 1,
                Some(false) => summary.page_failures += 1,
                None => {}
            }
        }
        Ok(())
    }

    /// Fetches and records one product page; `false` when it failed
    async fn read_product(&self, url: &str) -> Result<bool, DiscoveryError> {
        match self.with_session(ProductRequest { url }).await? {
            Ok(mut page) => {
                match self.descriptions.save(&page.product).await {
                    Ok(path) => page.product.description_path = Some(path),
                    Err(e) => warn!(url = %url, "⚠️ Could not save description: {e}"),
                }
                debug!(url = %url, sku = %page.product.sku, slots = page.slots.len(), "Product page read");
                self.handle.record_product(url, page).await;
                Ok(true)
            }
            Err(failure) => {
                self.record_failure(FailureTarget::ProductPage { url: url.to_string() }, failure)
                    .await;
                Ok(false)
            }
        }
    }

    async fn record_failure(&self, target: FailureTarget, failure: PageFailure) {
        self.handle
            .record_page_failure(target, failure.kind, &failure.reason, failure.attempts)
            .await;
    }

    /// Runs one page request on a pooled session, retrying transient
    /// errors and replacing the session when it is lost.
    async fn with_session<R: PageRequest>(&self, request: R) -> Result<Result<R::Output, PageFailure>, DiscoveryError> {
        let mut attempts_used = 0;
        let mut last_failure = None;

        for _ in 0..self.max_page_attempts {
            let mut session = self.pool.checkout().await?;

            let mut attempts = self.pool.retry.attempts(R::OPERATION);
            let outcome = loop {
                if let ControlFlow::Break(outcome) = attempts.next(request.send(session.as_mut())).await {
                    break outcome;
                }
            };
            attempts_used += attempts.attempt();

            match outcome {
                Ok(value) => {
                    self.pool.checkin(session).await;
                    return Ok(Ok(value));
                }
                Err(error) => {
                    let failure = PageFailure::from_retry(&error, attempts_used);
                    if failure.kind == FailureKind::SessionLost {
                        warn!(session = %session.session_id(), "🔁 Session lost during {}, replacing it", R::OPERATION);
                        last_failure = Some(failure);
                        continue;
                    }
                    self.pool.checkin(session).await;
                    return Ok(Err(failure));
                }
            }
        }

        Ok(Err(last_failure.unwrap_or_else(|| PageFailure {
            kind: FailureKind::SessionLost,
            reason: format!("{}: no usable session", R::OPERATION),
            attempts: attempts_used,
        })))
    }
}

#[derive(Debug, Default)]
struct ListingOutcome {
    pages_read: usize,
    failures: usize,
}
