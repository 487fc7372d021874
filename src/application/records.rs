//! Final record set of a completed run
//!
//! One [`InventoryRecord`] per expanded variant, with the previous run's
//! stock merged in. Failed variants keep their row with unknown stock so
//! nothing is silently dropped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::categorization::MAX_REPORT_ATTRIBUTES;
use crate::domain::{ProbeResult, StockLevel, Variant, VariantKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePair {
    pub description: String,
    pub value: String,
}

/// One exported row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub sku: String,
    pub brand: String,
    pub product_name: String,
    pub url: String,
    pub attributes: Vec<AttributePair>,
    pub price: Option<String>,
    pub current_stock: StockLevel,
    pub current_stock_date: Option<DateTime<Utc>>,
    pub previous_stock: Option<StockLevel>,
    pub previous_stock_date: Option<DateTime<Utc>>,
    pub description_path: Option<String>,
    pub description: String,
    pub image_url: Option<String>,
}

impl InventoryRecord {
    fn build(variant: &Variant, current: Option<&ProbeResult>, previous: Option<&ProbeResult>) -> Self {
        let product = &variant.product;
        Self {
            sku: product.sku.clone(),
            brand: product.brand.clone(),
            product_name: product.name.clone(),
            url: product.url.clone(),
            attributes: variant
                .attribute_pairs()
                .take(MAX_REPORT_ATTRIBUTES)
                .map(|(description, value)| AttributePair {
                    description: description.to_string(),
                    value: value.to_string(),
                })
                .collect(),
            price: current
                .and_then(|r| r.price.clone())
                .or_else(|| product.price.clone()),
            current_stock: current.map_or(StockLevel::Unknown, |r| r.stock),
            current_stock_date: current.map(|r| r.probed_at),
            previous_stock: previous.map(|r| r.stock),
            previous_stock_date: previous.map(|r| r.probed_at),
            description_path: product.description_path.clone(),
            description: product.description.clone(),
            image_url: product.image_url.clone(),
        }
    }
}

/// Builds the record set in variant order
#[must_use]
pub fn build_records(
    variants: &[Variant],
    current: &BTreeMap<VariantKey, ProbeResult>,
    previous: &BTreeMap<VariantKey, ProbeResult>,
) -> Vec<InventoryRecord> {
    variants
        .iter()
        .map(|variant| {
            let key = variant.key();
            InventoryRecord::build(variant, current.get(&key), previous.get(&key))
        })
        .collect()
}
