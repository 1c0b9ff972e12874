//! Per-worker bounded history.
//!
//! Each tracked worker gets a FIFO ring of its most recent observations.
//! Window queries are anchored on the newest observation in the ring, so
//! they follow pipeline time rather than the wall clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::types::{EventKind, Observation};

/// A zone or motion change between two consecutive observations of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: EventKind,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct EntityMemory {
    history: VecDeque<Observation>,
    capacity: usize,
}

impl EntityMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest observation once the ring is full.
    pub fn update(&mut self, observation: Observation) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(observation);
    }

    /// Contiguous suffix whose timestamps lie in `[latest - window, latest]`.
    /// A window reaching past the representable time range has no lower
    /// bound.
    pub fn window(&self, window: Duration) -> Vec<Observation> {
        let Some(latest) = self.history.back() else {
            return Vec::new();
        };
        let newest = latest.last_seen;
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| newest.checked_sub_signed(w));

        let mut out: Vec<Observation> = self
            .history
            .iter()
            .rev()
            .take_while(|o| cutoff.map_or(true, |c| o.last_seen >= c) && o.last_seen <= newest)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn latest(&self) -> Option<&Observation> {
        self.history.back()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.history.iter()
    }
}

/// All live worker histories, keyed by tracking id. Created lazily on first
/// sight; never explicitly removed.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    entities: HashMap<String, EntityMemory>,
    capacity: usize,
}

impl MemoryBank {
    pub fn new(capacity: usize) -> Self {
        Self {
            entities: HashMap::new(),
            capacity,
        }
    }

    /// Record an observation and report a zone/status change relative to
    /// the worker's previous observation, if any.
    pub fn update(&mut self, observation: Observation) -> Option<Transition> {
        let capacity = self.capacity;
        let memory = self
            .entities
            .entry(observation.id.clone())
            .or_insert_with(|| EntityMemory::new(capacity));

        let transition = memory.latest().and_then(|prev| {
            if prev.zone != observation.zone {
                Some(Transition {
                    kind: EventKind::ZoneChange,
                    description: format!(
                        "{} moved from {} to {}",
                        observation.id,
                        prev.zone.as_str(),
                        observation.zone.as_str()
                    ),
                })
            } else if prev.status != observation.status {
                Some(Transition {
                    kind: EventKind::StatusChange,
                    description: format!(
                        "{} is now {}",
                        observation.id,
                        observation.status.as_str()
                    ),
                })
            } else {
                None
            }
        });

        memory.update(observation);
        transition
    }

    /// Empty when the worker is unknown.
    pub fn windowed_history(&self, worker_id: &str, window: Duration) -> Vec<Observation> {
        self.entities
            .get(worker_id)
            .map(|m| m.window(window))
            .unwrap_or_default()
    }

    pub fn get(&self, worker_id: &str) -> Option<&EntityMemory> {
        self.entities.get(worker_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MotionStatus, Zone};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn obs(id: &str, secs: i64) -> Observation {
        Observation {
            id: id.to_string(),
            x: 50.0,
            y: 50.0,
            has_helmet: true,
            has_vest: true,
            zone: Zone::Safe,
            status: MotionStatus::Working,
            last_seen: at(secs),
            confidence: 0.9,
        }
    }

    #[test]
    fn ring_never_exceeds_capacity() {
        let mut m = EntityMemory::new(3);
        for i in 0..10 {
            m.update(obs("E1", i));
            assert!(m.len() <= 3);
        }
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut m = EntityMemory::new(100);
        for i in 0..101 {
            m.update(obs("E1", i));
        }
        assert_eq!(m.len(), 100);
        assert!(m.iter().all(|o| o.last_seen != at(0)));
        assert_eq!(m.iter().next().unwrap().last_seen, at(1));
    }

    #[test]
    fn window_is_inclusive_suffix_from_latest() {
        let mut m = EntityMemory::new(100);
        for i in 0..10 {
            m.update(obs("E1", i));
        }
        let w = m.window(Duration::from_secs(5));
        let secs: Vec<i64> = w.iter().map(|o| o.last_seen.timestamp() - 1_700_000_000).collect();
        assert_eq!(secs, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn huge_window_returns_whole_ring() {
        let mut m = EntityMemory::new(10);
        m.update(obs("E1", 0));
        assert_eq!(m.window(Duration::from_secs(u64::MAX)).len(), 1);

        m.update(obs("E1", 1));
        m.update(obs("E1", 2));
        // fits a chrono delta but lands before the earliest representable date
        let far = Duration::from_secs(400_000 * 365 * 86_400);
        assert_eq!(m.window(far).len(), 3);
    }

    #[test]
    fn window_anchors_on_latest_not_wall_clock() {
        let mut m = EntityMemory::new(10);
        m.update(obs("E1", -100_000));
        m.update(obs("E1", -99_999));
        assert_eq!(m.window(Duration::from_secs(5)).len(), 2);
    }

    #[test]
    fn window_stops_at_first_gap() {
        let mut m = EntityMemory::new(10);
        m.update(obs("E1", 0));
        m.update(obs("E1", 1));
        m.update(obs("E1", 20));
        m.update(obs("E1", 21));
        let w = m.window(Duration::from_secs(5));
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].last_seen, at(20));
    }

    #[test]
    fn empty_buffer_yields_empty_window() {
        let m = EntityMemory::new(10);
        assert!(m.window(Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn unknown_worker_yields_empty_history() {
        let bank = MemoryBank::new(10);
        assert!(bank.windowed_history("nobody", Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn bank_creates_memories_lazily() {
        let mut bank = MemoryBank::new(10);
        assert!(bank.is_empty());
        bank.update(obs("A", 0));
        bank.update(obs("B", 0));
        bank.update(obs("A", 1));
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.get("A").unwrap().len(), 2);
    }

    #[test]
    fn bank_reports_zone_and_status_changes() {
        let mut bank = MemoryBank::new(10);
        assert_eq!(bank.update(obs("A", 0)), None);

        let mut moved = obs("A", 1);
        moved.zone = Zone::LoadingDock;
        let t = bank.update(moved).unwrap();
        assert_eq!(t.kind, EventKind::ZoneChange);
        assert!(t.description.contains("Loading Dock"));

        let mut still = obs("A", 2);
        still.zone = Zone::LoadingDock;
        still.status = MotionStatus::Stationary;
        assert_eq!(bank.update(still).unwrap().kind, EventKind::StatusChange);
    }
}
