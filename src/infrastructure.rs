//! Infrastructure layer for configuration, persistence, parsing and the storefront adapter
//!
//! Everything that touches the outside world lives here: the config file,
//! logging, the retry wrapper, the on-disk session store, description files
//! and the HTTP storefront adapter with its page parsers.

pub mod config; // Configuration file and defaults
pub mod descriptions;
pub mod http_client;
pub mod logging; // Logging infrastructure
pub mod parsing; // Selector-driven page parsing
pub mod retry_manager;
pub mod session_store; // Versioned, checksummed JSON state
pub mod storefront; // HTTP BrowserSession implementation

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager};
pub use descriptions::DescriptionWriter;
pub use logging::{get_log_directory, init_logging_with_config, log_system_info};
pub use retry_manager::{RetryError, RetryExecutor, RetryPolicy};
pub use session_store::{Artifact, SessionStore, StoreError};
pub use storefront::{HttpStorefrontFactory, HttpStorefrontSession};
