//! Product description files
//!
//! Descriptions are written next to the run state as standalone HTML files
//! named after the product, so reports can link to them.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::domain::Product;
use crate::infrastructure::session_store::StoreError;

pub const DESCRIPTIONS_DIR: &str = "descriptions";

const UNNAMED: &str = "unnamed_product";

/// File name for a product description: `/` and `"` become spaces,
/// whitespace runs collapse to one space, `.html` is appended.
#[must_use]
pub fn clean_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '"') { ' ' } else { c })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        format!("{UNNAMED}.html")
    } else {
        format!("{collapsed}.html")
    }
}

#[derive(Debug, Clone)]
pub struct DescriptionWriter {
    root: PathBuf,
}

impl DescriptionWriter {
    /// Descriptions live in `<state_dir>/descriptions/`
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: state_dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn directory(&self) -> PathBuf {
        self.root.join(DESCRIPTIONS_DIR)
    }

    /// Writes the description and returns its path relative to the state directory
    pub async fn save(&self, product: &Product) -> Result<String, StoreError> {
        let dir = self.directory();
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let file_name = clean_file_name(&product.name);
        let path = dir.join(&file_name);
        fs::write(&path, product.description.as_bytes())
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(product = %product.sku, path = %path.display(), "📝 Description saved");
        Ok(format!("{DESCRIPTIONS_DIR}/{file_name}"))
    }
}
