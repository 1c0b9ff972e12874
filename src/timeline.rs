use std::collections::VecDeque;

use crate::types::TimelineEvent;

pub const DEFAULT_TIMELINE_CAPACITY: usize = 100;

/// Newest-first log of derived events, capped at `capacity`.
#[derive(Debug, Clone)]
pub struct GlobalTimeline {
    events: VecDeque<TimelineEvent>,
    capacity: usize,
}

impl Default for GlobalTimeline {
    fn default() -> Self {
        Self::new(DEFAULT_TIMELINE_CAPACITY)
    }
}

impl GlobalTimeline {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&mut self, event: TimelineEvent) {
        self.events.push_front(event);
        self.events.truncate(self.capacity);
    }

    /// Owned copy; later appends are not visible through it.
    pub fn snapshot(&self) -> Vec<TimelineEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
