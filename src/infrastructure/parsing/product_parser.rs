//! Product detail page parser
//!
//! Extracts the product, its attribute slots and its page-level
//! availability. The description keeps its HTML but loses every hyperlink
//! (the link text stays).

#![allow(clippy::uninlined_format_args)]

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use super::{
    ParsingError, ParsingResult, compile_selectors, extract_attr_with_fallbacks, extract_text_with_fallbacks,
    first_match, normalize_whitespace, resolve_url,
};
use crate::domain::{AttributeChoice, AttributeSlot, Availability, Product, ProductPage};
use crate::infrastructure::config::SelectorConfig;

#[derive(Debug)]
pub struct ProductPageParser {
    name: Vec<Selector>,
    brand: Vec<Selector>,
    sku: Vec<Selector>,
    product_id: Vec<Selector>,
    price: Vec<Selector>,
    image: Vec<Selector>,
    description: Vec<Selector>,
    availability: Vec<Selector>,
    unavailable_button: Vec<Selector>,
    attribute_selects: Vec<Selector>,
    option: Selector,
    hyperlink: Regex,
}

impl ProductPageParser {
    pub fn with_config(selectors: &SelectorConfig) -> ParsingResult<Self> {
        Ok(Self {
            name: compile_selectors("name", &selectors.name)?,
            brand: compile_selectors("brand", &selectors.brand)?,
            sku: compile_selectors("sku", &selectors.sku)?,
            product_id: compile_selectors("product_id", &selectors.product_id)?,
            price: compile_selectors("price", &selectors.price)?,
            image: compile_selectors("image", &selectors.image)?,
            description: compile_selectors("description", &selectors.description)?,
            availability: compile_selectors("availability", &selectors.availability)?,
            unavailable_button: compile_selectors("unavailable_button", &selectors.unavailable_button)?,
            attribute_selects: compile_selectors("attribute_selects", &selectors.attribute_selects)?,
            option: single_selector("option", "option")?,
            hyperlink: Regex::new(r"(?is)<a\b[^>]*>(.*?)</a>").map_err(|e| ParsingError::InvalidSelectors {
                field: "hyperlink_pattern",
                errors: e.to_string(),
            })?,
        })
    }

    pub fn parse(&self, html: &str, page_url: &str) -> ParsingResult<ProductPage> {
        let document = Html::parse_document(html);

        let name = extract_text_with_fallbacks(&document, &self.name).ok_or_else(|| {
            ParsingError::RequiredFieldMissing {
                field: "name",
                url: page_url.to_string(),
            }
        })?;

        let product_id = extract_attr_with_fallbacks(&document, &self.product_id, &["value", "data-product-id"]);
        let sku = extract_attr_with_fallbacks(&document, &self.sku, &["data-product-sku"])
            .or_else(|| extract_text_with_fallbacks(&document, &self.sku))
            .or_else(|| product_id.clone())
            .unwrap_or_else(|| page_url.to_string());

        let image_url = extract_attr_with_fallbacks(&document, &self.image, &["src", "data-src"])
            .map(|src| resolve_url(&src, page_url))
            .transpose()?;

        let description = first_match(&document, &self.description)
            .map(|section| self.strip_hyperlinks(&section.html()))
            .unwrap_or_default();

        let mut product = Product::new(sku, name, page_url).with_description(description);
        product.brand = extract_text_with_fallbacks(&document, &self.brand).unwrap_or_default();
        product.product_id = product_id;
        product.price = extract_text_with_fallbacks(&document, &self.price);
        product.image_url = image_url;

        let slots = self.attribute_slots(&document);
        let availability = self.availability(&document);

        debug!(
            "Parsed product {} ({}): {} slots, {:?}",
            product.name,
            product.sku,
            slots.len(),
            availability
        );
        Ok(ProductPage {
            product,
            slots,
            availability,
        })
    }

    /// Removes `<a>` tags while keeping their text
    #[must_use]
    pub fn strip_hyperlinks(&self, html: &str) -> String {
        self.hyperlink.replace_all(html, "$1").into_owned()
    }

    fn availability(&self, document: &Html) -> Availability {
        if first_match(document, &self.unavailable_button).is_some() {
            return Availability::Unavailable;
        }
        let out_of_stock = extract_text_with_fallbacks(document, &self.availability)
            .is_some_and(|text| text.to_lowercase().contains("out of stock"));
        if out_of_stock {
            Availability::OutOfStock
        } else {
            Availability::Purchasable
        }
    }

    fn attribute_slots(&self, document: &Html) -> Vec<AttributeSlot> {
        let Some(selector) = self
            .attribute_selects
            .iter()
            .find(|selector| document.select(selector).next().is_some())
        else {
            return Vec::new();
        };

        document
            .select(selector)
            .filter_map(|select| {
                let field = select.value().attr("name")?.to_string();
                let description = select
                    .value()
                    .attr("id")
                    .and_then(|id| label_for(document, id))
                    .unwrap_or_else(|| field.clone());

                let choices = select
                    .select(&self.option)
                    .filter_map(|option| {
                        let value = option.value().attr("value")?.trim();
                        if value.is_empty() {
                            // "Choose Options" placeholder
                            return None;
                        }
                        let label = normalize_whitespace(&option.text().collect::<String>());
                        Some(AttributeChoice::new(value, label))
                    })
                    .collect();

                Some(AttributeSlot::new(field, description, choices))
            })
            .collect()
    }
}

fn single_selector(field: &'static str, selector: &str) -> ParsingResult<Selector> {
    Selector::parse(selector).map_err(|e| ParsingError::InvalidSelectors {
        field,
        errors: e.to_string(),
    })
}

/// Text of `<label for=id>`, without the trailing colon and "Required" marker
fn label_for(document: &Html, id: &str) -> Option<String> {
    let selector = Selector::parse(&format!("label[for=\"{}\"]", id.replace('"', "\\\""))).ok()?;
    let label = document.select(&selector).next()?;
    let text = normalize_whitespace(&label.text().collect::<String>());
    let text = text.trim_end_matches("Required").trim().trim_end_matches(':').trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT: &str = r#"
        <html><body>
          <h1 class="productView-title">Arrow X</h1>
          <a class="product-brand" href="/brands/black-eagle">Black Eagle</a>
          <span class="productView-info-value--sku" data-product-sku="ARW-X-01">ARW-X-01</span>
          <input type="hidden" name="product_id" value="512">
          <span class="price--withoutTax">$129.99</span>
          <img class="product-main-image-slide" src="/images/arrow-x.jpg">
          <section id="description"><p>Carbon shaft. See <a href="/spine-chart">spine chart</a>.</p></section>
          <label for="attribute_select_12">Spine: <small>Required</small></label>
          <select class="product-attribute-select" name="attribute[12]" id="attribute_select_12">
            <option value="">Choose Options</option>
            <option value="101">300</option>
            <option value="102">350</option>
          </select>
          <label for="attribute_select_13">Fletching:</label>
          <select class="product-attribute-select" name="attribute[13]" id="attribute_select_13">
            <option value="201">Vanes</option>
          </select>
          <div class="product-add-to-cart form-field"><input type="submit" value="Add to Cart"></div>
        </body></html>
    "#;

    fn parser() -> ProductPageParser {
        ProductPageParser::with_config(&SelectorConfig::default()).unwrap()
    }

    #[test]
    fn extracts_product_fields() {
        let page = parser().parse(PRODUCT, "https://shop.test/arrow-x/").unwrap();
        let product = &page.product;

        assert_eq!(product.name, "Arrow X");
        assert_eq!(product.brand, "Black Eagle");
        assert_eq!(product.sku, "ARW-X-01");
        assert_eq!(product.product_id.as_deref(), Some("512"));
        assert_eq!(product.price.as_deref(), Some("$129.99"));
        assert_eq!(product.image_url.as_deref(), Some("https://shop.test/images/arrow-x.jpg"));
        assert!(product.description.contains("See spine chart."));
        assert!(!product.description.contains("<a"));
        assert_eq!(page.availability, Availability::Purchasable);
    }

    #[test]
    fn extracts_attribute_slots_with_labels() {
        let page = parser().parse(PRODUCT, "https://shop.test/arrow-x/").unwrap();

        assert_eq!(page.slots.len(), 2);
        assert_eq!(page.slots[0].field, "attribute[12]");
        assert_eq!(page.slots[0].description, "Spine");
        assert_eq!(
            page.slots[0].choices,
            vec![AttributeChoice::new("101", "300"), AttributeChoice::new("102", "350")]
        );
        assert_eq!(page.slots[1].description, "Fletching");
    }

    #[test]
    fn sku_falls_back_to_product_id() {
        let html = r#"<h1>Nock kit</h1><input name="product_id" value="77">"#;
        let page = parser().parse(html, "https://shop.test/nock-kit/").unwrap();
        assert_eq!(page.product.sku, "77");

        let html = "<h1>Bare</h1>";
        let page = parser().parse(html, "https://shop.test/bare/").unwrap();
        assert_eq!(page.product.sku, "https://shop.test/bare/");
    }

    #[test]
    fn unavailable_button_and_out_of_stock_text() {
        let html = r#"<h1>Quiver</h1>
            <div class="product-add-to-cart form-field"><input type="submit" value="Unavailable"></div>"#;
        assert_eq!(parser().parse(html, "https://shop.test/q/").unwrap().availability, Availability::Unavailable);

        let html = r#"<h1>Quiver</h1><span data-product-stock-message>Currently out of Stock</span>"#;
        assert_eq!(parser().parse(html, "https://shop.test/q/").unwrap().availability, Availability::OutOfStock);
    }

    #[test]
    fn missing_name_is_an_error() {
        let err = parser().parse("<p>nothing</p>", "https://shop.test/x/").unwrap_err();
        assert!(matches!(err, ParsingError::RequiredFieldMissing { field: "name", .. }));
    }
}
