use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::variant::VariantKey;

/// Inferred stock of one variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "quantity", rename_all = "snake_case")]
pub enum StockLevel {
    Exact(u32),
    /// The probe ceiling itself was accepted
    AtLeast(u32),
    Unknown,
}

impl StockLevel {
    /// Comparable quantity; `AtLeast(c)` counts as `c`
    #[must_use]
    pub const fn quantity(self) -> Option<u32> {
        match self {
            Self::Exact(n) | Self::AtLeast(n) => Some(n),
            Self::Unknown => None,
        }
    }

    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for StockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "{n}"),
            Self::AtLeast(n) => write!(f, "≥{n}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of probing one variant. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub key: VariantKey,
    pub stock: StockLevel,
    pub probed_at: DateTime<Utc>,
    pub price: Option<String>,
    pub oracle_calls: u32,
}

impl ProbeResult {
    #[must_use]
    pub fn new(key: VariantKey, stock: StockLevel, price: Option<String>, oracle_calls: u32) -> Self {
        Self {
            key,
            stock,
            probed_at: Utc::now(),
            price,
            oracle_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_counts_as_ceiling() {
        assert_eq!(StockLevel::AtLeast(100).quantity(), Some(100));
        assert_eq!(StockLevel::Exact(0).quantity(), Some(0));
        assert_eq!(StockLevel::Unknown.quantity(), None);
    }

    #[test]
    fn stock_level_display() {
        assert_eq!(StockLevel::Exact(7).to_string(), "7");
        assert_eq!(StockLevel::AtLeast(100).to_string(), "≥100");
        assert_eq!(StockLevel::Unknown.to_string(), "unknown");
    }

    #[test]
    fn stock_level_serde_shape() {
        let json = serde_json::to_string(&StockLevel::AtLeast(100)).unwrap();
        assert_eq!(json, r#"{"kind":"at_least","quantity":100}"#);
        let unknown: StockLevel = serde_json::from_str(r#"{"kind":"unknown"}"#).unwrap();
        assert_eq!(unknown, StockLevel::Unknown);
    }
}
