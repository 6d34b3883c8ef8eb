use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use shared::domain::{ActionKind, ActionOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ActionKind,
    pub summary: String,
    pub outcome: ActionOutcome,
}

impl HistoryEntry {
    pub fn new(kind: ActionKind, summary: impl Into<String>, outcome: ActionOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            summary: summary.into(),
            outcome,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    max_visible: usize,
}

impl HistoryLog {
    pub fn new(capacity: usize, max_visible: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_visible: max_visible.min(capacity),
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    pub fn visible(&self) -> Vec<HistoryEntry> {
        self.entries.iter().take(self.max_visible).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
