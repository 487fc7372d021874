//! Domain module - Core inventory entities
//!
//! Products as discovered on the storefront, the variants expanded from
//! their attribute slots, and the stock levels the prober infers for them.
//!
//! Modern Rust module organization:
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod inventory;
pub mod product;
pub mod variant;

pub use inventory::{ProbeResult, StockLevel};
pub use product::{
    AttributeChoice, AttributeSlot, Availability, Product, ProductPage, SelectedAttribute,
};
pub use variant::{Variant, VariantKey};
