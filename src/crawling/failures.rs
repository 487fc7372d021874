//! # Failure Tracker
//!
//! Durable record of everything that could not be completed: variants whose
//! probe was abandoned and product or listing pages that could not be read.
//! An entry disappears as soon as a later attempt succeeds.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::VariantKey;

/// What failed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureTarget {
    Variant { key: VariantKey, url: String },
    ProductPage { url: String },
    ListingPage { url: String },
}

impl FailureTarget {
    /// Stable map key, e.g. `variant:ARW-1|S`
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Variant { key, .. } => format!("variant:{key}"),
            Self::ProductPage { url } => format!("product:{url}"),
            Self::ListingPage { url } => format!("listing:{url}"),
        }
    }
}

impl fmt::Display for FailureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProbeExhausted,
    SessionLost,
    Navigation,
    Extraction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub target: FailureTarget,
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// The one extra try granted on resume has been spent
    pub resume_retry_used: bool,
}

/// Failures keyed by [`FailureTarget::id`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureTracker {
    entries: BTreeMap<String, FailureRecord>,
}

impl FailureTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure, merging with an earlier entry for the same target
    pub fn record(&mut self, target: FailureTarget, kind: FailureKind, reason: impl Into<String>, attempts: u32) {
        let now = Utc::now();
        let reason = reason.into();
        self.entries
            .entry(target.id())
            .and_modify(|existing| {
                existing.kind = kind;
                existing.reason.clone_from(&reason);
                existing.attempts += attempts;
                existing.last_failed_at = now;
            })
            .or_insert_with(|| FailureRecord {
                target,
                kind,
                reason,
                attempts,
                first_failed_at: now,
                last_failed_at: now,
                resume_retry_used: false,
            });
    }

    /// Drops the entry after a successful attempt
    pub fn resolve(&mut self, target: &FailureTarget) -> Option<FailureRecord> {
        self.entries.remove(&target.id())
    }

    #[must_use]
    pub fn get(&self, target: &FailureTarget) -> Option<&FailureRecord> {
        self.entries.get(&target.id())
    }

    /// Spends the resume retry. Returns `false` when it was already spent
    /// or the target is not failed.
    pub fn claim_resume_retry(&mut self, target: &FailureTarget) -> bool {
        match self.entries.get_mut(&target.id()) {
            Some(record) if !record.resume_retry_used => {
                record.resume_retry_used = true;
                true
            }
            _ => false,
        }
    }

    /// Whether the target failed and already used its resume retry
    #[must_use]
    pub fn is_permanently_failed(&self, target: &FailureTarget) -> bool {
        self.get(target).is_some_and(|r| r.resume_retry_used)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailureRecord> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> Vec<FailureRecord> {
        self.entries.values().cloned().collect()
    }
}
