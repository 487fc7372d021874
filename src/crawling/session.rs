//! # Browser Session Capability
//!
//! The core never touches a DOM or an HTTP client directly. It talks to an
//! opaque session that can open pages, select a variant and answer the
//! add-to-cart question. Each worker owns one session; sessions are never
//! shared between workers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Availability, ProductPage, Variant};
use crate::infrastructure::retry_manager::RetryableError;

/// 세션 에러 타입
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionError {
    #[error("Timeout after {after:?} during {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// The session can no longer be used and must be recreated
    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SessionError {
    #[must_use]
    pub const fn is_session_lost(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }
}

impl RetryableError for SessionError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::SessionLost(_) | Self::Extraction(_) | Self::InvalidInput(_) => false,
        }
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            after,
        }
    }
}

/// Answer of the add-to-cart oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartVerdict {
    Accepted,
    Rejected { reason: String },
}

impl CartVerdict {
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// One page of a category listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    /// Highest page number shown by the pagination; 1 when absent
    pub total_pages: u32,
    /// Absolute product URLs in page order
    pub product_urls: Vec<String>,
}

/// State of a product page after the variant's attributes were selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantPage {
    pub availability: Availability,
    pub price: Option<String>,
}

/// Black-box add-to-cart oracle
#[async_trait]
pub trait CartOracle: Send {
    async fn try_add_to_cart(&mut self, variant: &Variant, quantity: u32) -> Result<CartVerdict, SessionError>;

    /// Empties the cart so the next probe starts from zero
    async fn clear_cart(&mut self) -> Result<(), SessionError>;
}

/// Page extraction plus cart access, owned by exactly one worker
#[async_trait]
pub trait BrowserSession: CartOracle {
    fn session_id(&self) -> &str;

    async fn open_listing(&mut self, listing_url: &str, page: u32) -> Result<ListingPage, SessionError>;

    async fn open_product(&mut self, url: &str) -> Result<ProductPage, SessionError>;

    /// Navigates to the product and selects the variant's attributes
    async fn open_variant(&mut self, variant: &Variant) -> Result<VariantPage, SessionError>;
}

/// Creates fresh, isolated sessions (own cookies, own cart)
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}
