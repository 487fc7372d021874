//! Application layer module
//!
//! Use cases that drive the crawling layer end to end and turn its probe
//! results into the record set and report categories.

pub mod categorization;
pub mod inventory_run;
pub mod records;

pub use categorization::{ReportCategories, StockCategory, VariantSummary, categorize, classify};
pub use inventory_run::{InventoryRun, RunError, RunReport, RunStatus};
pub use records::{AttributePair, InventoryRecord, build_records};
