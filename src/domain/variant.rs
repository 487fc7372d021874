use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::product::{Product, SelectedAttribute};

/// Identity of a variant: the product SKU plus the selected values in slot order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantKey {
    pub sku: String,
    pub values: Vec<String>,
}

impl VariantKey {
    #[must_use]
    pub fn new(sku: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            sku: sku.into(),
            values,
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sku)?;
        for value in &self.values {
            write!(f, "|{value}")?;
        }
        Ok(())
    }
}

/// A product plus one selected attribute per slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub product: Arc<Product>,
    pub selections: Vec<SelectedAttribute>,
}

impl Variant {
    #[must_use]
    pub fn new(product: Arc<Product>, selections: Vec<SelectedAttribute>) -> Self {
        Self {
            product,
            selections,
        }
    }

    #[must_use]
    pub fn key(&self) -> VariantKey {
        VariantKey::new(
            self.product.sku.clone(),
            self.selections.iter().map(|s| s.value.clone()).collect(),
        )
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.product.url
    }

    /// `(description, display value)` pairs in slot order
    pub fn attribute_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.selections
            .iter()
            .map(|s| (s.description.as_str(), s.display_value()))
    }
}
