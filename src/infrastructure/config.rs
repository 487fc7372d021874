//! Configuration infrastructure
//!
//! JSON configuration for the inventory prober, loaded through
//! [`ConfigManager`]. Every section carries `#[serde(default)]` so a partial
//! file only overrides what it names; the constants live in [`defaults`].

#![allow(clippy::uninlined_format_args)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::infrastructure::retry_manager::RetryPolicy;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub crawl: CrawlConfig,
    pub probe: ProbeConfig,
    pub retry: RetryPolicy,
    pub timing: TimingConfig,
    pub session: SessionConfig,
    pub storefront: StorefrontConfig,
    pub logging: LoggingConfig,
}

/// What to crawl and how wide
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Category listing pages to discover products from
    pub listing_urls: Vec<String>,
    /// Number of workers, each owning one browser session
    pub concurrency: usize,
    /// `false` makes sessions log every navigation and cart action
    pub headless: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            listing_urls: defaults::LISTING_URLS.iter().map(|s| (*s).to_string()).collect(),
            concurrency: defaults::CONCURRENCY,
            headless: true,
        }
    }
}

/// Inventory probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Largest quantity ever requested from the cart
    pub ceiling: u32,
    /// Attempts per variant, session restarts included
    pub max_variant_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ceiling: defaults::PROBE_CEILING,
            max_variant_attempts: defaults::MAX_VARIANT_ATTEMPTS,
        }
    }
}

/// Timeouts and intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub navigation_timeout_seconds: u64,
    pub oracle_timeout_seconds: u64,
    pub flush_timeout_seconds: u64,
    /// Grace period for in-flight probes after shutdown was requested
    pub shutdown_timeout_seconds: u64,
    /// Stats reporting interval in seconds
    pub stats_interval_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            navigation_timeout_seconds: defaults::NAVIGATION_TIMEOUT_SECONDS,
            oracle_timeout_seconds: defaults::ORACLE_TIMEOUT_SECONDS,
            flush_timeout_seconds: defaults::FLUSH_TIMEOUT_SECONDS,
            shutdown_timeout_seconds: defaults::SHUTDOWN_TIMEOUT_SECONDS,
            stats_interval_seconds: defaults::STATS_INTERVAL_SECONDS,
        }
    }
}

impl TimingConfig {
    #[must_use]
    pub const fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_seconds)
    }

    #[must_use]
    pub const fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_seconds)
    }

    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_seconds)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }
}

/// What to do when persisted state cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptStatePolicy {
    /// Refuse to start
    #[default]
    Fail,
    /// Move the bad file aside and start a fresh run
    StartFresh,
}

/// Persistence of the in-progress run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root of `session/`, `history/` and `descriptions/`
    pub state_dir: PathBuf,
    pub flush_every_completions: u32,
    pub flush_interval_seconds: u64,
    pub on_corrupt_state: CorruptStatePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(defaults::STATE_DIR),
            flush_every_completions: defaults::FLUSH_EVERY_COMPLETIONS,
            flush_interval_seconds: defaults::FLUSH_INTERVAL_SECONDS,
            on_corrupt_state: CorruptStatePolicy::Fail,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }
}

/// HTTP storefront adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorefrontConfig {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout_seconds: u64,
    pub max_requests_per_second: u32,
    pub endpoints: EndpointConfig,
    pub selectors: SelectorConfig,
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::BASE_URL.to_string(),
            user_agent: defaults::USER_AGENT.to_string(),
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            endpoints: EndpointConfig::default(),
            selectors: SelectorConfig::default(),
        }
    }
}

/// Storefront endpoint paths, relative to `base_url`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Followed by the product id
    pub product_attributes: String,
    pub cart_add: String,
    /// Cart API; `DELETE <cart_api>/<id>` empties a cart
    pub cart_api: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            product_attributes: "/remote/v1/product-attributes".to_string(),
            cart_add: "/remote/v1/cart/add".to_string(),
            cart_api: "/api/storefront/carts".to_string(),
        }
    }
}

/// CSS selectors for listing and product pages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub pagination_links: Vec<String>,
    pub product_links: Vec<String>,
    pub name: Vec<String>,
    pub brand: Vec<String>,
    pub sku: Vec<String>,
    /// Element whose `value` attribute holds the product id
    pub product_id: Vec<String>,
    pub price: Vec<String>,
    /// Image element; `src` or `data-src`
    pub image: Vec<String>,
    pub description: Vec<String>,
    pub availability: Vec<String>,
    pub unavailable_button: Vec<String>,
    pub attribute_selects: Vec<String>,
}

fn owned(selectors: &[&str]) -> Vec<String> {
    selectors.iter().map(|s| (*s).to_string()).collect()
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            pagination_links: owned(&["a.listing-pagination-link", ".pagination-item a"]),
            product_links: owned(&["div.product-item-image a", ".card-figure a"]),
            name: owned(&["h1.productView-title", "h1"]),
            brand: owned(&["a.product-brand", ".productView-brand a"]),
            sku: owned(&["[data-product-sku]", "span.productView-info-value--sku"]),
            product_id: owned(&["input[name=\"product_id\"]"]),
            price: owned(&["[data-product-price-without-tax]", ".price--withoutTax"]),
            image: owned(&["img.product-main-image-slide", ".productView-image img"]),
            description: owned(&["section#description", "#tab-description"]),
            availability: owned(&["[data-product-stock-message]", ".productView-info-value--availability"]),
            unavailable_button: owned(&[
                "div.product-add-to-cart input[value=\"Unavailable\"]",
                "#form-action-addToCart[disabled]",
            ]),
            attribute_selects: owned(&["select.product-attribute-select", "select.form-select--attribute"]),
        }
    }
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Directory for log files; defaults to `logs/` next to the executable
    pub directory: Option<PathBuf>,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,

    /// Module-specific log level filters (e.g., "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_filters = HashMap::new();
        module_filters.insert("reqwest".to_string(), "info".to_string());
        module_filters.insert("hyper".to_string(), "warn".to_string());
        module_filters.insert("html5ever".to_string(), "warn".to_string());
        module_filters.insert("selectors".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            directory: None,
            max_files: defaults::MAX_LOG_FILES,
            module_filters,
        }
    }
}

/// Rejected configuration values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl AppConfig {
    /// Applies command line overrides on top of the file values
    #[must_use]
    pub fn with_overrides(mut self, concurrency: Option<usize>, headless: Option<bool>) -> Self {
        if let Some(concurrency) = concurrency {
            self.crawl.concurrency = concurrency;
        }
        if let Some(headless) = headless {
            self.crawl.headless = headless;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crawl.concurrency == 0 {
            return Err(ConfigError::invalid("crawl.concurrency", "must be at least 1"));
        }
        if self.crawl.listing_urls.is_empty() {
            return Err(ConfigError::invalid("crawl.listing_urls", "at least one listing URL is required"));
        }
        for listing in &self.crawl.listing_urls {
            url::Url::parse(listing)
                .map_err(|e| ConfigError::invalid("crawl.listing_urls", format!("{listing}: {e}")))?;
        }
        if self.probe.ceiling == 0 {
            return Err(ConfigError::invalid("probe.ceiling", "must be at least 1"));
        }
        if self.probe.max_variant_attempts == 0 {
            return Err(ConfigError::invalid("probe.max_variant_attempts", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid("retry.backoff_multiplier", "must be a finite value >= 1.0"));
        }
        if self.session.flush_every_completions == 0 {
            return Err(ConfigError::invalid("session.flush_every_completions", "must be at least 1"));
        }
        if self.session.flush_interval_seconds == 0 {
            return Err(ConfigError::invalid("session.flush_interval_seconds", "must be at least 1"));
        }
        for (field, value) in [
            ("timing.navigation_timeout_seconds", self.timing.navigation_timeout_seconds),
            ("timing.oracle_timeout_seconds", self.timing.oracle_timeout_seconds),
            ("timing.flush_timeout_seconds", self.timing.flush_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1 second"));
            }
        }
        url::Url::parse(&self.storefront.base_url)
            .map_err(|e| ConfigError::invalid("storefront.base_url", e.to_string()))?;
        if self.storefront.max_requests_per_second == 0 {
            return Err(ConfigError::invalid("storefront.max_requests_per_second", "must be at least 1"));
        }
        Ok(())
    }
}

/// Loads and saves [`AppConfig`] as JSON
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("inventory-prober");

        Ok(config_dir)
    }

    /// Manager for the default location `<config_dir>/inventory-prober/config.json`
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join("config.json");
        Ok(Self { config_path })
    }

    #[must_use]
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Initialize configuration system on first run
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        if let Some(config_dir) = self.config_path.parent() {
            if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
                fs::create_dir_all(config_dir)
                    .await
                    .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
                info!("✅ Created configuration directory: {:?}", config_dir);
            }
        }

        if self.config_path.exists() {
            self.load_config().await
        } else {
            info!("🎉 First run detected - writing default configuration to {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            Ok(default_config)
        }
    }

    /// Load configuration from file
    pub async fn load_config(&self) -> Result<AppConfig> {
        let content = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read configuration file: {:?}", self.config_path))?;

        let config = serde_json::from_str::<AppConfig>(&content)
            .with_context(|| format!("Failed to parse configuration file: {:?}", self.config_path))?;

        if config.crawl.listing_urls.is_empty() {
            warn!("⚠️ Configuration has no listing URLs: {:?}", self.config_path);
        }
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .with_context(|| format!("Failed to write configuration file: {:?}", self.config_path))?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }
}

/// Default values for configuration
pub mod defaults {
    /// Category listings of the storefront the prober was built for
    pub const LISTING_URLS: &[&str] = &[
        "https://blackeaglearrows.com/bow-accessories/",
        "https://blackeaglearrows.com/arrows/",
        "https://blackeaglearrows.com/components/",
        "https://blackeaglearrows.com/gear/",
    ];
    pub const BASE_URL: &str = "https://blackeaglearrows.com";
    pub const USER_AGENT: &str = "inventory-prober/0.1";

    /// Default worker count
    pub const CONCURRENCY: usize = 3;

    pub const PROBE_CEILING: u32 = 100;
    pub const MAX_VARIANT_ATTEMPTS: u32 = 3;

    pub const RETRY_MAX_ATTEMPTS: u32 = 4;
    pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
    pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
    pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const RETRY_JITTER_RANGE_MS: u64 = 500;

    pub const NAVIGATION_TIMEOUT_SECONDS: u64 = 60;
    pub const ORACLE_TIMEOUT_SECONDS: u64 = 30;
    pub const FLUSH_TIMEOUT_SECONDS: u64 = 10;
    pub const SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
    pub const STATS_INTERVAL_SECONDS: u64 = 30;

    pub const STATE_DIR: &str = "inventory-state";
    pub const FLUSH_EVERY_COMPLETIONS: u32 = 10;
    pub const FLUSH_INTERVAL_SECONDS: u64 = 30;

    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    /// 1000ms / 150ms = ~6.66 -> 7
    pub const MAX_REQUESTS_PER_SECOND: u32 = 7;

    pub const MAX_LOG_FILES: u32 = 5;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = AppConfig::default().with_overrides(Some(0), None);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "crawl.concurrency", .. })
        ));
    }

    #[test]
    fn zero_ceiling_and_bad_base_url_are_rejected() {
        let mut config = AppConfig::default();
        config.probe.ceiling = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storefront.base_url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "storefront.base_url", .. })
        ));
    }

    #[test]
    fn empty_listing_set_is_rejected() {
        let mut config = AppConfig::default();
        config.crawl.listing_urls.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply_before_validation() {
        let config = AppConfig::default().with_overrides(Some(8), Some(false));
        assert_eq!(config.crawl.concurrency, 8);
        assert!(!config.crawl.headless);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"probe": {"ceiling": 50}, "session": {"on_corrupt_state": "start_fresh"}}"#)
                .unwrap();
        assert_eq!(config.probe.ceiling, 50);
        assert_eq!(config.probe.max_variant_attempts, defaults::MAX_VARIANT_ATTEMPTS);
        assert_eq!(config.session.on_corrupt_state, CorruptStatePolicy::StartFresh);
        assert_eq!(config.crawl.concurrency, defaults::CONCURRENCY);
    }

    #[tokio::test]
    async fn first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.json"));

        let created = manager.initialize_on_first_run().await.unwrap();
        assert!(manager.config_path().exists());

        let reloaded = manager.load_config().await.unwrap();
        assert_eq!(reloaded.probe.ceiling, created.probe.ceiling);
        assert_eq!(reloaded.crawl.listing_urls, created.crawl.listing_urls);
    }
}
