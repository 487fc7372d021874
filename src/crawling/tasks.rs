//! # Probe Task Definitions
//!
//! A task is one variant travelling through the work queue. It carries its
//! own attempt count so session restarts can be charged against the
//! variant's budget.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Variant, VariantKey};

/// Unique identifier for probe tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new unique task ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TaskId> for Uuid {
    fn from(task_id: TaskId) -> Self {
        task_id.0
    }
}

/// One variant to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTask {
    pub task_id: TaskId,
    pub variant: Variant,
    /// Attempts already charged to this variant in the current run
    pub attempts: u32,
    /// The variant failed in an earlier process and gets its one extra try
    pub resumed_failure: bool,
}

impl ProbeTask {
    #[must_use]
    pub fn new(variant: Variant) -> Self {
        Self {
            task_id: TaskId::new(),
            variant,
            attempts: 0,
            resumed_failure: false,
        }
    }

    #[must_use]
    pub fn resumed(variant: Variant) -> Self {
        Self {
            resumed_failure: true,
            ..Self::new(variant)
        }
    }

    #[must_use]
    pub fn key(&self) -> VariantKey {
        self.variant.key()
    }

    #[must_use]
    pub const fn task_type(&self) -> &'static str {
        "probe_variant"
    }

    /// Charges one attempt and issues a new task id for the retry
    #[must_use]
    pub fn charged(mut self) -> Self {
        self.attempts += 1;
        self.task_id = TaskId::new();
        self
    }
}

impl fmt::Display for ProbeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] attempt {}", self.task_type(), self.variant.key(), self.attempts + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Product;
    use std::sync::Arc;

    #[test]
    fn task_id_creation() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn charging_counts_attempts_and_renews_id() {
        let variant = Variant::new(Arc::new(Product::new("ARW-1", "Arrow X", "https://shop.test/a")), vec![]);
        let task = ProbeTask::new(variant);
        let first_id = task.task_id;

        let retried = task.charged();
        assert_eq!(retried.attempts, 1);
        assert_ne!(retried.task_id, first_id);
        assert!(!retried.resumed_failure);
    }
}
