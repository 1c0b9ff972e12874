//! Detection capability and site geometry.
//!
//! The detector itself is an external model; this module defines the seam
//! it plugs into, the zone geometry shared between detector and classifier,
//! and a simulated detector for running the pipeline without a model.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{Frame, MotionStatus, Observation, Zone};

#[async_trait]
pub trait Detector: Send + Sync {
    /// Tracked workers visible in `frame`, in a stable order.
    async fn detect(&self, frame: &Frame) -> Result<Vec<Observation>>;
}

/// Axis-aligned rectangle in normalized 0..100 coordinates, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Rect {
    pub const fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self { x_min, y_min, x_max, y_max }
    }

    /// Parses `"x_min,y_min,x_max,y_max"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<f64> = raw
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [x0, y0, x1, y1] if x0 <= x1 && y0 <= y1 => Some(Self::new(*x0, *y0, *x1, *y1)),
            _ => None,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }
}

/// Hazard zones of the site. Anything outside both is `Safe`; the
/// excavation pit wins where the two overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneMap {
    pub loading_dock: Rect,
    pub excavation_pit: Rect,
}

impl Default for ZoneMap {
    fn default() -> Self {
        Self {
            loading_dock: Rect::new(60.0, 0.0, 100.0, 50.0),
            excavation_pit: Rect::new(0.0, 50.0, 45.0, 100.0),
        }
    }
}

impl ZoneMap {
    pub fn zone_at(&self, x: f64, y: f64) -> Zone {
        if self.excavation_pit.contains(x, y) {
            Zone::ExcavationPit
        } else if self.loading_dock.contains(x, y) {
            Zone::LoadingDock
        } else {
            Zone::Safe
        }
    }
}

#[derive(Debug, Clone)]
struct SimWorker {
    id: String,
    x: f64,
    y: f64,
    has_helmet: bool,
    has_vest: bool,
    status: MotionStatus,
}

struct SimState {
    workers: Vec<SimWorker>,
    rng: StdRng,
}

/// Random-walk crew standing in for a real model. Positions drift a little
/// each frame, zones come from the map, and helmets occasionally come off
/// and go back on.
pub struct SimulatedDetector {
    zones: ZoneMap,
    state: Mutex<SimState>,
}

impl SimulatedDetector {
    pub fn new(zones: ZoneMap) -> Self {
        Self::with_rng(zones, StdRng::from_entropy())
    }

    pub fn seeded(zones: ZoneMap, seed: u64) -> Self {
        Self::with_rng(zones, StdRng::seed_from_u64(seed))
    }

    fn with_rng(zones: ZoneMap, rng: StdRng) -> Self {
        let crew = |id: &str, x: f64, y: f64, helmet: bool, vest: bool, status: MotionStatus| SimWorker {
            id: id.to_string(),
            x,
            y,
            has_helmet: helmet,
            has_vest: vest,
            status,
        };
        let workers = vec![
            crew("WK-01", 20.0, 20.0, true, true, MotionStatus::Working),
            crew("WK-02", 70.0, 30.0, true, false, MotionStatus::Moving),
            crew("WK-03", 15.0, 70.0, false, true, MotionStatus::Stationary),
        ];
        Self {
            zones,
            state: Mutex::new(SimState { workers, rng }),
        }
    }
}

#[async_trait]
impl Detector for SimulatedDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Observation>> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let SimState { workers, rng } = &mut *guard;

        let mut out = Vec::with_capacity(workers.len());
        for w in workers.iter_mut() {
            if w.status != MotionStatus::Stationary {
                w.x = (w.x + (rng.gen::<f64>() - 0.5) * 3.0).clamp(5.0, 95.0);
                w.y = (w.y + (rng.gen::<f64>() - 0.5) * 3.0).clamp(5.0, 95.0);
            }

            let roll: f64 = rng.gen();
            if roll > 0.995 && w.has_helmet {
                w.has_helmet = false;
            } else if roll < 0.005 && !w.has_helmet {
                w.has_helmet = true;
            }

            out.push(Observation {
                id: w.id.clone(),
                x: w.x,
                y: w.y,
                has_helmet: w.has_helmet,
                has_vest: w.has_vest,
                zone: self.zones.zone_at(w.x, w.y),
                status: w.status,
                last_seen: frame.captured_at,
                confidence: rng.gen_range(0.85..0.99),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame() -> Frame {
        Frame {
            seq: 1,
            captured_at: Utc::now(),
            data: Vec::new(),
        }
    }

    #[test]
    fn default_zone_geometry() {
        let z = ZoneMap::default();
        assert_eq!(z.zone_at(80.0, 20.0), Zone::LoadingDock);
        assert_eq!(z.zone_at(20.0, 80.0), Zone::ExcavationPit);
        assert_eq!(z.zone_at(50.0, 50.0), Zone::Safe);
        assert_eq!(z.zone_at(20.0, 20.0), Zone::Safe);
    }

    #[test]
    fn overlap_prefers_excavation_pit() {
        let z = ZoneMap {
            loading_dock: Rect::new(0.0, 0.0, 100.0, 100.0),
            excavation_pit: Rect::new(0.0, 0.0, 10.0, 10.0),
        };
        assert_eq!(z.zone_at(5.0, 5.0), Zone::ExcavationPit);
        assert_eq!(z.zone_at(50.0, 50.0), Zone::LoadingDock);
    }

    #[test]
    fn rect_parse() {
        assert_eq!(Rect::parse("60, 0, 100, 50"), Some(Rect::new(60.0, 0.0, 100.0, 50.0)));
        assert_eq!(Rect::parse("1,2,3"), None);
        assert_eq!(Rect::parse("10,0,5,5"), None);
        assert_eq!(Rect::parse("a,b,c,d"), None);
    }

    #[tokio::test]
    async fn simulated_detector_keeps_stable_ids_and_bounds() {
        let det = SimulatedDetector::seeded(ZoneMap::default(), 7);
        let f = frame();
        for _ in 0..200 {
            let obs = det.detect(&f).await.unwrap();
            let ids: Vec<&str> = obs.iter().map(|o| o.id.as_str()).collect();
            assert_eq!(ids, vec!["WK-01", "WK-02", "WK-03"]);
            for o in &obs {
                assert!((5.0..=95.0).contains(&o.x));
                assert!((5.0..=95.0).contains(&o.y));
                assert_eq!(o.last_seen, f.captured_at);
                assert_eq!(o.zone, ZoneMap::default().zone_at(o.x, o.y));
            }
        }
    }

    #[tokio::test]
    async fn stationary_workers_hold_position() {
        let det = SimulatedDetector::seeded(ZoneMap::default(), 1);
        let first = det.detect(&frame()).await.unwrap();
        let second = det.detect(&frame()).await.unwrap();
        assert_eq!(first[2].status, MotionStatus::Stationary);
        assert_eq!((first[2].x, first[2].y), (second[2].x, second[2].y));
        assert_eq!(second[2].zone, Zone::ExcavationPit);
    }
}
