//! # Stock Categorization
//!
//! Compares each variant's stock with the previous completed run and sorts
//! it into at most one report category.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ProbeResult, StockLevel, Variant, VariantKey};

/// Attribute pairs carried into summaries and records
pub const MAX_REPORT_ATTRIBUTES: usize = 4;

/// Stock at or above this is "high"
pub const HIGH_STOCK_THRESHOLD: u32 = 5;

/// Stock exactly at this is "low"
pub const LOW_STOCK_LEVEL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockCategory {
    OutOfStock,
    BackInStock,
    HighStock,
    LowStock,
}

/// Category of one variant, rules checked in order:
/// newly out, newly back, high, low.
///
/// `Unknown` on either side never counts as a transition and an unknown
/// current level is never categorized. `AtLeast(c)` compares as `c`.
#[must_use]
pub fn classify(previous: Option<StockLevel>, current: StockLevel) -> Option<StockCategory> {
    let current = current.quantity()?;

    match previous.and_then(StockLevel::quantity) {
        Some(before) if before > 0 && current == 0 => return Some(StockCategory::OutOfStock),
        Some(0) if current > 0 => return Some(StockCategory::BackInStock),
        _ => {}
    }

    if current >= HIGH_STOCK_THRESHOLD {
        Some(StockCategory::HighStock)
    } else if current == LOW_STOCK_LEVEL {
        Some(StockCategory::LowStock)
    } else {
        None
    }
}

/// What the report shows for one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub product_name: String,
    /// `(description, value)` pairs, at most [`MAX_REPORT_ATTRIBUTES`]
    pub attributes: Vec<(String, String)>,
}

impl VariantSummary {
    #[must_use]
    pub fn of(variant: &Variant) -> Self {
        Self {
            product_name: variant.product.name.clone(),
            attributes: variant
                .attribute_pairs()
                .take(MAX_REPORT_ATTRIBUTES)
                .map(|(description, value)| (description.to_string(), value.to_string()))
                .collect(),
        }
    }
}

/// The four lists handed to the report collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCategories {
    pub out_of_stock: Vec<VariantSummary>,
    pub back_in_stock: Vec<VariantSummary>,
    pub high_stock: Vec<VariantSummary>,
    pub low_stock: Vec<VariantSummary>,
}

impl ReportCategories {
    fn list_mut(&mut self, category: StockCategory) -> &mut Vec<VariantSummary> {
        match category {
            StockCategory::OutOfStock => &mut self.out_of_stock,
            StockCategory::BackInStock => &mut self.back_in_stock,
            StockCategory::HighStock => &mut self.high_stock,
            StockCategory::LowStock => &mut self.low_stock,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.out_of_stock.len() + self.back_in_stock.len() + self.high_stock.len() + self.low_stock.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Categorizes `variants` in the order given (expansion order).
/// Variants without a current result are skipped.
#[must_use]
pub fn categorize(
    variants: &[Variant],
    current: &BTreeMap<VariantKey, ProbeResult>,
    previous: &BTreeMap<VariantKey, ProbeResult>,
) -> ReportCategories {
    let mut categories = ReportCategories::default();
    for variant in variants {
        let key = variant.key();
        let Some(result) = current.get(&key) else {
            continue;
        };
        let before = previous.get(&key).map(|r| r.stock);
        if let Some(category) = classify(before, result.stock) {
            categories.list_mut(category).push(VariantSummary::of(variant));
        }
    }
    categories
}
