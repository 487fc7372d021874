use serde::{Deserialize, Serialize};

/// Product information extracted from a product detail page.
///
/// Immutable once discovered. `sku` is the identity and is never empty:
/// the extractor falls back to the storefront product id, then to the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub brand: String,
    pub name: String,
    pub url: String,
    /// Storefront product id posted with cart and attribute requests
    pub product_id: Option<String>,
    /// List price as displayed on the product page
    pub price: Option<String>,
    /// Description HTML with hyperlinks stripped
    pub description: String,
    /// File the description was saved to, relative to the state directory
    pub description_path: Option<String>,
    pub image_url: Option<String>,
}

impl Product {
    #[must_use]
    pub fn new(sku: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            brand: String::new(),
            name: name.into(),
            url: url.into(),
            product_id: None,
            price: None,
            description: String::new(),
            description_path: None,
            image_url: None,
        }
    }

    #[must_use]
    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = brand.into();
        self
    }

    #[must_use]
    pub fn with_product_id(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    #[must_use]
    pub fn with_price(mut self, price: impl Into<String>) -> Self {
        self.price = Some(price.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_image_url(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }
}

/// One `(value, label)` choice of an attribute slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChoice {
    pub value: String,
    pub label: String,
}

impl AttributeChoice {
    #[must_use]
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// One selectable attribute of a product (e.g. "Size")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSlot {
    /// Form field name posted to the storefront
    pub field: String,
    /// Human readable description
    pub description: String,
    pub choices: Vec<AttributeChoice>,
}

impl AttributeSlot {
    #[must_use]
    pub fn new(
        field: impl Into<String>,
        description: impl Into<String>,
        choices: Vec<AttributeChoice>,
    ) -> Self {
        Self {
            field: field.into(),
            description: description.into(),
            choices,
        }
    }
}

/// A concrete choice for one slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectedAttribute {
    pub field: String,
    pub description: String,
    pub value: String,
    pub label: String,
}

impl SelectedAttribute {
    #[must_use]
    pub fn from_choice(slot: &AttributeSlot, choice: &AttributeChoice) -> Self {
        Self {
            field: slot.field.clone(),
            description: slot.description.clone(),
            value: choice.value.clone(),
            label: choice.label.clone(),
        }
    }

    /// Label shown to people; the raw value when the storefront gave no label
    #[must_use]
    pub fn display_value(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.value
        } else {
            &self.label
        }
    }
}

/// Purchasability as reported by a product or variant page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Purchasable,
    /// The page states the item is out of stock
    OutOfStock,
    /// The add-to-cart button is disabled ("Unavailable")
    Unavailable,
}

impl Availability {
    #[must_use]
    pub const fn is_purchasable(self) -> bool {
        matches!(self, Self::Purchasable)
    }
}

/// Everything extracted from one product detail page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPage {
    pub product: Product,
    pub slots: Vec<AttributeSlot>,
    pub availability: Availability,
}
