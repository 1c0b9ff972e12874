//! Turns oracle verdicts into incident records.
//!
//! The filter is pure: it neither persists nor emits timeline events. The
//! incident kind comes from the worker's current zone and PPE attributes,
//! never from the oracle's free text.

use chrono::Utc;

use crate::types::{Incident, IncidentKind, MotionStatus, Observation, Severity, Verdict, Zone};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct DecisionFilter {
    threshold: f64,
}

impl Default for DecisionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl DecisionFilter {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Accepts iff the verdict flags an incident with confidence strictly
    /// above the threshold. A rejection is a normal outcome.
    pub fn evaluate(&self, verdict: &Verdict, current: &Observation) -> Option<Incident> {
        if !verdict.incident || !(verdict.confidence > self.threshold) {
            return None;
        }
        let (kind, severity) = classify(current);
        let details = if verdict.reason.trim().is_empty() {
            kind.as_str().to_string()
        } else {
            verdict.reason.trim().to_string()
        };
        Some(Incident {
            id: mint_incident_id(),
            timestamp: Utc::now(),
            worker_id: current.id.clone(),
            kind,
            severity,
            confidence: verdict.confidence.min(1.0),
            details,
            acknowledged: false,
            notes: Vec::new(),
            image_digest: None,
        })
    }
}

pub fn mint_incident_id() -> String {
    format!("INC-{}", uuid::Uuid::new_v4().simple())
}

/// Kind and severity for a worker flagged by the oracle.
///
/// Hazardous zone presence outranks PPE state; a flagged worker that is in
/// a safe zone and fully equipped is recorded as an unsafe posture.
pub fn classify(obs: &Observation) -> (IncidentKind, Severity) {
    match obs.zone {
        Zone::ExcavationPit => return (IncidentKind::ZoneIntrusion, Severity::High),
        Zone::LoadingDock => {
            let severity = if obs.status == MotionStatus::Stationary {
                Severity::High
            } else {
                Severity::Medium
            };
            return (IncidentKind::ZoneIntrusion, severity);
        }
        Zone::Safe => {}
    }
    if !obs.has_helmet {
        return (IncidentKind::PpeViolation, Severity::High);
    }
    if !obs.has_vest {
        return (IncidentKind::PpeViolation, Severity::Medium);
    }
    let severity = if obs.status == MotionStatus::Stationary {
        Severity::Medium
    } else {
        Severity::Low
    };
    (IncidentKind::UnsafePosture, severity)
}
