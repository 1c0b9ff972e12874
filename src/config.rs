use std::path::PathBuf;
use std::time::Duration;

use crate::perception::{Rect, ZoneMap};

#[derive(Debug, Clone)]
pub struct Config {
    pub source: String,
    /// Frame-rate ceiling; 0 disables throttling.
    pub fps: u32,
    /// Reasoning runs on every Nth cycle.
    pub reason_every: u64,
    pub window: Duration,
    pub min_history: usize,
    pub history_capacity: usize,
    pub confidence_threshold: f64,
    pub recent_incidents: usize,
    pub timeline_capacity: usize,
    pub data_dir: PathBuf,
    pub incident_cap: usize,
    pub oracle_url: String,
    pub oracle_model: String,
    pub api_key: Option<String>,
    pub oracle_timeout: Duration,
    pub retry_pause: Duration,
    pub ws_addr: String,
    pub subscriber_buffer: usize,
    pub zones: ZoneMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: "./frames".to_string(),
            fps: 5,
            reason_every: 5,
            window: Duration::from_secs(5),
            min_history: 4,
            history_capacity: 100,
            confidence_threshold: 0.85,
            recent_incidents: 10,
            timeline_capacity: 100,
            data_dir: PathBuf::from("./data"),
            incident_cap: 1000,
            oracle_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            oracle_model: "gemini-1.5-flash".to_string(),
            api_key: None,
            oracle_timeout: Duration::from_millis(10_000),
            retry_pause: Duration::from_millis(1_000),
            ws_addr: "0.0.0.0:8000".to_string(),
            subscriber_buffer: 64,
            zones: ZoneMap::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            source: std::env::var("SENTINEL_SOURCE").unwrap_or(d.source),
            fps: env_parse("SENTINEL_FPS").unwrap_or(d.fps),
            reason_every: env_parse::<u64>("SENTINEL_REASON_EVERY").unwrap_or(d.reason_every).max(1),
            window: env_parse("SENTINEL_WINDOW_SECS").map(Duration::from_secs).unwrap_or(d.window),
            min_history: env_parse("SENTINEL_MIN_HISTORY").unwrap_or(d.min_history),
            history_capacity: env_parse::<usize>("SENTINEL_HISTORY_CAP").unwrap_or(d.history_capacity).max(1),
            confidence_threshold: env_parse("SENTINEL_CONFIDENCE_TH").unwrap_or(d.confidence_threshold),
            recent_incidents: env_parse("SENTINEL_RECENT_INCIDENTS").unwrap_or(d.recent_incidents),
            timeline_capacity: d.timeline_capacity,
            data_dir: std::env::var("SENTINEL_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            incident_cap: env_parse::<usize>("SENTINEL_INCIDENT_CAP").unwrap_or(d.incident_cap).max(1),
            oracle_url: std::env::var("SENTINEL_ORACLE_URL").unwrap_or(d.oracle_url),
            oracle_model: std::env::var("SENTINEL_ORACLE_MODEL").unwrap_or(d.oracle_model),
            api_key: std::env::var("GENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            oracle_timeout: env_parse("SENTINEL_ORACLE_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.oracle_timeout),
            retry_pause: env_parse("SENTINEL_RETRY_PAUSE_MS").map(Duration::from_millis).unwrap_or(d.retry_pause),
            ws_addr: std::env::var("SENTINEL_WS_ADDR").unwrap_or(d.ws_addr),
            subscriber_buffer: env_parse::<usize>("SENTINEL_SUBSCRIBER_BUFFER").unwrap_or(d.subscriber_buffer).max(1),
            zones: ZoneMap {
                loading_dock: std::env::var("SENTINEL_LOADING_DOCK")
                    .ok()
                    .and_then(|v| Rect::parse(&v))
                    .unwrap_or(d.zones.loading_dock),
                excavation_pit: std::env::var("SENTINEL_EXCAVATION_PIT")
                    .ok()
                    .and_then(|v| Rect::parse(&v))
                    .unwrap_or(d.zones.excavation_pit),
            },
        }
    }

    pub fn frame_interval(&self) -> Option<Duration> {
        if self.fps == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(1.0 / self.fps as f64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.fps, 5);
        assert_eq!(cfg.reason_every, 5);
        assert_eq!(cfg.window, Duration::from_secs(5));
        assert_eq!(cfg.min_history, 4);
        assert_eq!(cfg.history_capacity, 100);
        assert_eq!(cfg.incident_cap, 1000);
        assert_eq!(cfg.recent_incidents, 10);
        assert_eq!(cfg.confidence_threshold, 0.85);
    }

    #[test]
    fn frame_interval_from_fps() {
        let mut cfg = Config::default();
        assert_eq!(cfg.frame_interval(), Some(Duration::from_millis(200)));
        cfg.fps = 0;
        assert_eq!(cfg.frame_interval(), None);
    }
}
