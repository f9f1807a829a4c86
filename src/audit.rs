//! Bounded security event log.
//!
//! Entries are appended, never edited. When the ring is full the oldest entry
//! is dropped.

use std::collections::VecDeque;

/// Default number of retained events.
pub const EVENT_RING_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub action: String,
    pub passed: bool,
}

impl AuditEntry {
    /// One-line rendering used in state snapshots.
    pub fn render(&self) -> String {
        let verdict = if self.passed { "ok" } else { "fail" };
        format!("{} {} {}", self.timestamp, verdict, self.action)
    }
}

#[derive(Debug, Clone)]
pub struct EventRing {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
}

impl EventRing {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn log(&mut self, timestamp: u64, action: impl Into<String>, passed: bool) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(AuditEntry {
            timestamp,
            action: action.into(),
            passed,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.entries.iter().map(AuditEntry::render).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let mut ring = EventRing::new();
        for i in 0..15u64 {
            ring.log(i, format!("check-{i}"), i % 2 == 0);
        }
        assert_eq!(ring.len(), EVENT_RING_CAPACITY);
        let first = ring.entries().next().unwrap();
        assert_eq!(first.timestamp, 5);
        assert_eq!(first.action, "check-5");
    }

    #[test]
    fn test_render() {
        let mut ring = EventRing::with_capacity(2);
        ring.log(7, "debugger", false);
        assert_eq!(ring.rendered(), vec!["7 fail debugger".to_string()]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut ring = EventRing::with_capacity(0);
        ring.log(1, "a", true);
        ring.log(2, "b", true);
        assert_eq!(ring.len(), 1);
    }
}
