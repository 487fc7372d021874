//! # Work Queue
//!
//! Keeps every known variant key in exactly one of `Pending`, `InFlight`,
//! `Done` or `Failed`. Pending tasks are served in enqueue order, which is
//! the deterministic expansion order.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crawling::tasks::ProbeTask;
use crate::domain::VariantKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Number of keys per state
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueCounts {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.in_flight + self.done + self.failed
    }

    /// Nothing left to hand out and nothing being worked on
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Variant {key} is {actual:?}, expected {expected:?}")]
    InvalidTransition {
        key: String,
        expected: WorkState,
        actual: WorkState,
    },

    #[error("Variant {0} is not known to the queue")]
    Unknown(String),
}

/// Partitioned work queue
#[derive(Debug, Default)]
pub struct WorkQueue {
    states: HashMap<VariantKey, WorkState>,
    pending: VecDeque<ProbeTask>,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task unless its key is already known. Returns whether it was added.
    pub fn enqueue(&mut self, task: ProbeTask) -> bool {
        let key = task.key();
        if self.states.contains_key(&key) {
            return false;
        }
        self.states.insert(key, WorkState::Pending);
        self.pending.push_back(task);
        true
    }

    /// Registers a key that is already done (resumption)
    pub fn seed_done(&mut self, key: VariantKey) -> bool {
        self.seed(key, WorkState::Done)
    }

    /// Registers a key that already failed for good (resumption)
    pub fn seed_failed(&mut self, key: VariantKey) -> bool {
        self.seed(key, WorkState::Failed)
    }

    fn seed(&mut self, key: VariantKey, state: WorkState) -> bool {
        if self.states.contains_key(&key) {
            return false;
        }
        self.states.insert(key, state);
        true
    }

    /// Hands out the oldest pending task and marks it in flight
    pub fn next_pending(&mut self) -> Option<ProbeTask> {
        let task = self.pending.pop_front()?;
        self.states.insert(task.key(), WorkState::InFlight);
        Some(task)
    }

    pub fn mark_done(&mut self, key: &VariantKey) -> Result<(), QueueError> {
        self.transition(key, WorkState::InFlight, WorkState::Done)
    }

    pub fn mark_failed(&mut self, key: &VariantKey) -> Result<(), QueueError> {
        self.transition(key, WorkState::InFlight, WorkState::Failed)
    }

    /// Puts an in-flight task back at the end of the pending line
    pub fn requeue(&mut self, task: ProbeTask) -> Result<(), QueueError> {
        self.transition(&task.key(), WorkState::InFlight, WorkState::Pending)?;
        self.pending.push_back(task);
        Ok(())
    }

    fn transition(&mut self, key: &VariantKey, expected: WorkState, next: WorkState) -> Result<(), QueueError> {
        let state = self
            .states
            .get_mut(key)
            .ok_or_else(|| QueueError::Unknown(key.to_string()))?;
        if *state != expected {
            return Err(QueueError::InvalidTransition {
                key: key.to_string(),
                expected,
                actual: *state,
            });
        }
        *state = next;
        Ok(())
    }

    #[must_use]
    pub fn is_already_done(&self, key: &VariantKey) -> bool {
        self.states.get(key) == Some(&WorkState::Done)
    }

    #[must_use]
    pub fn state_of(&self, key: &VariantKey) -> Option<WorkState> {
        self.states.get(key).copied()
    }

    #[must_use]
    pub fn keys_in(&self, state: WorkState) -> Vec<VariantKey> {
        let mut keys: Vec<VariantKey> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for state in self.states.values() {
            match state {
                WorkState::Pending => counts.pending += 1,
                WorkState::InFlight => counts.in_flight += 1,
                WorkState::Done => counts.done += 1,
                WorkState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
