//! Records that flow through the pipeline and out to subscribers.
//!
//! Field names and enum spellings follow the dashboard wire format
//! (`workerId`, `hasHelmet`, `"Loading Dock"`, `"PPE Violation"`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Zone {
    Safe,
    #[serde(rename = "Loading Dock")]
    LoadingDock,
    #[serde(rename = "Excavation Pit")]
    ExcavationPit,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Safe => "Safe",
            Zone::LoadingDock => "Loading Dock",
            Zone::ExcavationPit => "Excavation Pit",
        }
    }

    pub fn is_hazardous(&self) -> bool {
        !matches!(self, Zone::Safe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotionStatus {
    Moving,
    Stationary,
    Working,
}

impl MotionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionStatus::Moving => "Moving",
            MotionStatus::Stationary => "Stationary",
            MotionStatus::Working => "Working",
        }
    }
}

/// One frame's detector output for one tracked worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    /// Normalized 0..100.
    pub x: f64,
    pub y: f64,
    pub has_helmet: bool,
    pub has_vest: bool,
    pub zone: Zone,
    pub status: MotionStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub confidence: f64,
}

impl Observation {
    pub fn is_compliant(&self) -> bool {
        self.has_helmet && self.has_vest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Zone Change")]
    ZoneChange,
    #[serde(rename = "Status Change")]
    StatusChange,
    Violation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: String,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub description: String,
}

impl TimelineEvent {
    pub fn new(worker_id: &str, timestamp: DateTime<Utc>, kind: EventKind, description: String) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4().simple()),
            worker_id: worker_id.to_string(),
            timestamp,
            kind,
            description,
        }
    }

    pub fn violation(incident: &Incident) -> Self {
        Self::new(
            &incident.worker_id,
            incident.timestamp,
            EventKind::Violation,
            format!("{}: {}", incident.kind.as_str(), incident.details),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentKind {
    #[serde(rename = "PPE Violation")]
    PpeViolation,
    #[serde(rename = "Zone Intrusion")]
    ZoneIntrusion,
    #[serde(rename = "Unsafe Posture")]
    UnsafePosture,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::PpeViolation => "PPE Violation",
            IncidentKind::ZoneIntrusion => "Zone Intrusion",
            IncidentKind::UnsafePosture => "Unsafe Posture",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// A confirmed safety violation. Immutable after creation except for the
/// acknowledged flag and the notes list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    #[serde(rename = "type")]
    pub kind: IncidentKind,
    pub severity: Severity,
    pub confidence: f64,
    pub details: String,
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    /// SHA-256 of the stored image artifact, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}

/// The oracle's determination for one windowed history.
///
/// `incident` and `confidence` are required on the wire; anything missing
/// them is treated as malformed and replaced by [`Verdict::safe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(alias = "isIncident", alias = "is_incident")]
    pub incident: bool,
    #[serde(default)]
    pub reason: String,
    pub confidence: f64,
}

impl Verdict {
    pub fn safe(reason: impl Into<String>) -> Self {
        Self {
            incident: false,
            reason: reason.into(),
            confidence: 0.0,
        }
    }
}

/// Encoded image bytes plus capture metadata. Pixel decoding is left to
/// the detector.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub fps: f64,
    pub active_workers: usize,
    pub system_status: String,
    pub cycle: u64,
}

/// Complete broadcastable state for one cycle. Built fresh, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub workers: Vec<Observation>,
    pub incidents: Vec<Incident>,
    pub timeline: Vec<TimelineEvent>,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_uses_display_names_on_the_wire() {
        let json = serde_json::to_string(&Zone::ExcavationPit).unwrap();
        assert_eq!(json, "\"Excavation Pit\"");
        let back: Zone = serde_json::from_str("\"Loading Dock\"").unwrap();
        assert_eq!(back, Zone::LoadingDock);
    }

    #[test]
    fn observation_serializes_camel_case() {
        let obs = Observation {
            id: "WK-01".to_string(),
            x: 10.0,
            y: 20.0,
            has_helmet: true,
            has_vest: false,
            zone: Zone::Safe,
            status: MotionStatus::Working,
            last_seen: Utc::now(),
            confidence: 0.9,
        };
        let v = serde_json::to_value(&obs).unwrap();
        assert_eq!(v["hasHelmet"], true);
        assert_eq!(v["hasVest"], false);
        assert!(v.get("lastSeen").is_some());
    }

    #[test]
    fn verdict_accepts_is_incident_alias() {
        let v: Verdict =
            serde_json::from_str(r#"{"isIncident": true, "reason": "x", "confidence": 0.9}"#).unwrap();
        assert!(v.incident);
        assert_eq!(v.confidence, 0.9);
    }

    #[test]
    fn verdict_requires_confidence() {
        let parsed: Result<Verdict, _> = serde_json::from_str(r#"{"incident": true}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn incident_omits_empty_notes() {
        let inc = Incident {
            id: "INC-1".to_string(),
            timestamp: Utc::now(),
            worker_id: "WK-01".to_string(),
            kind: IncidentKind::PpeViolation,
            severity: Severity::High,
            confidence: 0.9,
            details: "no helmet".to_string(),
            acknowledged: false,
            notes: Vec::new(),
            image_digest: None,
        };
        let v = serde_json::to_value(&inc).unwrap();
        assert_eq!(v["type"], "PPE Violation");
        assert_eq!(v["workerId"], "WK-01");
        assert!(v.get("notes").is_none());
    }
}
