//! Category listing page parser
//!
//! Reads the pagination to learn how many pages a listing has and collects
//! the product links of one page.

#![allow(clippy::uninlined_format_args)]

use std::collections::HashSet;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use super::{ParsingError, ParsingResult, compile_selectors, resolve_url};
use crate::crawling::session::ListingPage;
use crate::infrastructure::config::SelectorConfig;

#[derive(Debug)]
pub struct ListingParser {
    pagination_selectors: Vec<Selector>,
    product_link_selectors: Vec<Selector>,
    number: Regex,
    page_param: Regex,
}

impl ListingParser {
    pub fn with_config(selectors: &SelectorConfig) -> ParsingResult<Self> {
        Ok(Self {
            pagination_selectors: compile_selectors("pagination_links", &selectors.pagination_links)?,
            product_link_selectors: compile_selectors("product_links", &selectors.product_links)?,
            number: compile_regex(r"\d+")?,
            page_param: compile_regex(r"[?&]page=(\d+)")?,
        })
    }

    pub fn parse(&self, html: &str, page_url: &str) -> ParsingResult<ListingPage> {
        let document = Html::parse_document(html);
        let listing = ListingPage {
            total_pages: self.total_pages(&document),
            product_urls: self.product_urls(&document, page_url)?,
        };
        debug!(
            "Parsed listing {}: {} products, {} pages",
            page_url,
            listing.product_urls.len(),
            listing.total_pages
        );
        Ok(listing)
    }

    /// Largest number found in the pagination links; 1 without pagination
    fn total_pages(&self, document: &Html) -> u32 {
        self.pagination_selectors
            .iter()
            .flat_map(|selector| document.select(selector))
            .flat_map(|link| {
                let text = link.text().collect::<String>();
                let mut numbers: Vec<u32> = self
                    .number
                    .find_iter(&text)
                    .filter_map(|m| m.as_str().parse().ok())
                    .collect();
                if let Some(page) = link
                    .value()
                    .attr("href")
                    .and_then(|href| self.page_param.captures(href))
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse().ok())
                {
                    numbers.push(page);
                }
                numbers
            })
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Absolute product URLs from the first selector that matches, page order kept
    fn product_urls(&self, document: &Html, page_url: &str) -> ParsingResult<Vec<String>> {
        for selector in &self.product_link_selectors {
            let mut seen = HashSet::new();
            let mut urls = Vec::new();
            for link in document.select(selector) {
                let Some(href) = link.value().attr("href") else {
                    continue;
                };
                let url = resolve_url(href, page_url)?;
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
            if !urls.is_empty() {
                return Ok(urls);
            }
        }
        Ok(Vec::new())
    }
}

fn compile_regex(pattern: &str) -> ParsingResult<Regex> {
    Regex::new(pattern).map_err(|e| ParsingError::InvalidSelectors {
        field: "pagination_pattern",
        errors: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <html><body>
          <div class="product-item-image"><a href="/arrow-x/">Arrow X</a></div>
          <div class="product-item-image"><a href="https://shop.test/nock-kit/">Nock kit</a></div>
          <div class="product-item-image"><a href="/arrow-x/">Arrow X again</a></div>
          <ul class="pagination">
            <li><a class="listing-pagination-link" href="/arrows/?page=2">2</a></li>
            <li><a class="listing-pagination-link" href="/arrows/?page=7">Last</a></li>
          </ul>
        </body></html>
    "#;

    fn parser() -> ListingParser {
        ListingParser::with_config(&SelectorConfig::default()).unwrap()
    }

    #[test]
    fn reads_pagination_and_links() {
        let page = parser().parse(LISTING, "https://shop.test/arrows/").unwrap();
        assert_eq!(page.total_pages, 7);
        assert_eq!(
            page.product_urls,
            vec!["https://shop.test/arrow-x/", "https://shop.test/nock-kit/"]
        );
    }

    #[test]
    fn missing_pagination_means_one_page() {
        let page = parser()
            .parse("<html><body><p>No products</p></body></html>", "https://shop.test/gear/")
            .unwrap();
        assert_eq!(page.total_pages, 1);
        assert!(page.product_urls.is_empty());
    }
}
