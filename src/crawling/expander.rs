//! # Attribute Expander
//!
//! Turns a product and its attribute slots into the full Cartesian product
//! of variants. The first slot varies slowest, so unchanged input always
//! yields the same sequence.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{AttributeSlot, Product, SelectedAttribute, Variant};

/// Expands products into variants
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeExpander;

impl AttributeExpander {
    /// Every combination of one choice per slot.
    ///
    /// No slots gives one implicit variant. A slot without choices gives no
    /// variants at all.
    #[must_use]
    pub fn expand(product: &Arc<Product>, slots: &[AttributeSlot]) -> Vec<Variant> {
        if let Some(empty) = slots.iter().find(|slot| slot.choices.is_empty()) {
            warn!(
                sku = %product.sku,
                slot = %empty.description,
                "⚠️ Attribute slot has no choices, product yields no variants"
            );
            return Vec::new();
        }

        let mut combinations: Vec<Vec<SelectedAttribute>> = vec![Vec::with_capacity(slots.len())];
        for slot in slots {
            combinations = combinations
                .into_iter()
                .flat_map(|prefix| {
                    slot.choices.iter().map(move |choice| {
                        let mut selections = prefix.clone();
                        selections.push(SelectedAttribute::from_choice(slot, choice));
                        selections
                    })
                })
                .collect();
        }

        debug!(sku = %product.sku, slots = slots.len(), variants = combinations.len(), "Expanded product");
        combinations
            .into_iter()
            .map(|selections| Variant::new(Arc::clone(product), selections))
            .collect()
    }
}
