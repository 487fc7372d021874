//! HTML parsing infrastructure for storefront pages
//!
//! Selector-driven extraction of listing pages and product pages. Every
//! field is looked up through a list of CSS selectors tried in order, so a
//! theme change usually only needs a configuration edit.

pub mod error;
pub mod listing_parser;
pub mod product_parser;

pub use error::{ParsingError, ParsingResult};
pub use listing_parser::ListingParser;
pub use product_parser::ProductPageParser;

use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use url::Url;

/// Compile multiple selector strings; invalid ones are logged and skipped
pub(crate) fn compile_selectors(field: &'static str, selector_strings: &[String]) -> ParsingResult<Vec<Selector>> {
    let mut selectors = Vec::new();
    let mut errors = Vec::new();

    for selector_str in selector_strings {
        match Selector::parse(selector_str) {
            Ok(selector) => selectors.push(selector),
            Err(e) => {
                warn!("Failed to compile selector '{}': {}", selector_str, e);
                errors.push(format!("'{selector_str}': {e}"));
            }
        }
    }

    if selectors.is_empty() && !selector_strings.is_empty() {
        return Err(ParsingError::InvalidSelectors {
            field,
            errors: errors.join(", "),
        });
    }
    Ok(selectors)
}

/// First matching element across the fallback selectors
pub(crate) fn first_match<'a>(document: &'a Html, selectors: &[Selector]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|selector| document.select(selector).next())
}

/// Trimmed text of the first non-empty match
pub(crate) fn extract_text_with_fallbacks(document: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        document
            .select(selector)
            .map(|e| normalize_whitespace(&e.text().collect::<String>()))
            .find(|text| !text.is_empty())
    })
}

/// First non-empty value of `attributes` on any match
pub(crate) fn extract_attr_with_fallbacks(document: &Html, selectors: &[Selector], attributes: &[&str]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        document.select(selector).find_map(|e| {
            attributes
                .iter()
                .find_map(|attr| e.value().attr(attr))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
    })
}

pub(crate) fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves `href` against the page it was found on
pub(crate) fn resolve_url(href: &str, page_url: &str) -> ParsingResult<String> {
    let base = Url::parse(page_url).map_err(|e| ParsingError::UrlResolutionFailed {
        url: page_url.to_string(),
        reason: format!("Invalid base URL: {e}"),
    })?;
    base.join(href.trim())
        .map(|u| u.to_string())
        .map_err(|e| ParsingError::UrlResolutionFailed {
            url: href.to_string(),
            reason: format!("Failed to join URL: {e}"),
        })
}
