//! Parsing error types

use thiserror::Error;

pub type ParsingResult<T> = Result<T, ParsingError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParsingError {
    #[error("No valid selectors for {field}: {errors}")]
    InvalidSelectors { field: &'static str, errors: String },

    #[error("Required field '{field}' missing on {url}")]
    RequiredFieldMissing { field: &'static str, url: String },

    #[error("URL resolution failed for {url}: {reason}")]
    UrlResolutionFailed { url: String, reason: String },
}
