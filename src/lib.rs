//! Inventory Prober - storefront catalog discovery and stock probing
//!
//! Discovers every product of a storefront's category listings, expands each
//! product into its attribute variants and infers each variant's stock by
//! binary-searching the add-to-cart quantity. Runs are resumable: progress is
//! flushed to versioned JSON files and an interrupted run picks up where it
//! stopped. A completed run is compared against the previous one and sorted
//! into report categories.

// Module declarations
pub mod application;
pub mod crawling;
pub mod domain;
pub mod infrastructure;

/// Scripted storefront and fixtures shared by unit and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use application::{InventoryRun, RunReport, RunStatus};
pub use infrastructure::config::AppConfig;
