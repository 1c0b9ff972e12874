//! Reasoning oracle capability.
//!
//! An [`Oracle`] looks at one worker's windowed history and says whether it
//! shows a safety incident. Implementations may fail; the agent loop turns
//! any failure or timeout into [`Verdict::safe`] via [`consult`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::error::SentinelError;
use crate::logging::{agg_increment, log, log_fault, obj, v_str, Domain, Level, ProfileScope};
use crate::types::{Observation, Verdict, Zone};

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn analyze(&self, worker_id: &str, history: &[Observation]) -> Result<Verdict>;
}

/// One best-effort oracle call bounded by `timeout`. Never fails.
pub async fn consult(oracle: &dyn Oracle, worker_id: &str, history: &[Observation], timeout: Duration) -> Verdict {
    let _scope = ProfileScope::with_context("oracle", &[("worker_id", v_str(worker_id))]);
    agg_increment("verdict");
    match tokio::time::timeout(timeout, oracle.analyze(worker_id, history)).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(err)) => {
            let err = SentinelError::OracleUnavailable(format!("{:#}", err));
            log_fault(Domain::Reasoning, "analyze", &err.to_string());
            Verdict::safe(format!("Analysis error: {}", err))
        }
        Err(_) => {
            log_fault(Domain::Reasoning, "analyze", &SentinelError::OracleTimeout.to_string());
            Verdict::safe("Analysis timed out")
        }
    }
}

pub fn build_prompt(history_json: &str) -> String {
    format!(
        r#"You are a construction safety officer AI. Analyze the following worker timeline for safety incidents.

Timeline Data:
{history_json}

Safety Rules:
1. PPE Compliance: Workers must have 'hasHelmet': true and 'hasVest': true at all times.
2. Hazardous Zones: 'Loading Dock' and 'Excavation Pit' are high-risk.
3. Loitering: Status 'Stationary' in a hazardous zone for more than 5 seconds is a warning.

Task:
Determine if there is a safety incident based on the timeline.
Return ONLY a valid JSON object with no markdown formatting, matching this schema:
{{
  "incident": boolean,
  "reason": "concise explanation of the violation or 'Safe'",
  "confidence": float between 0.0 and 1.0
}}
"#
    )
}

/// Parse the model's text into a verdict, tolerating a markdown code fence
/// around the JSON. Confidence is clamped into `[0, 1]`.
pub fn parse_verdict(text: &str) -> Result<Verdict> {
    let body = strip_code_fence(text.trim());
    let mut verdict: Verdict =
        serde_json::from_str(body).with_context(|| format!("malformed verdict: {}", truncate(body, 200)))?;
    if !verdict.confidence.is_finite() {
        return Err(anyhow!("non-finite confidence"));
    }
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

fn strip_code_fence(text: &str) -> &str {
    if !text.starts_with("```") {
        return text;
    }
    let after_open = match text.find('\n') {
        Some(idx) => &text[idx + 1..],
        None => return text.trim_start_matches('`'),
    };
    after_open.trim_end().trim_end_matches("```").trim()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// =============================================================================
// Remote generative model
// =============================================================================

/// Oracle backed by a `generateContent`-style HTTP endpoint. One attempt per
/// call, no retry.
pub struct HttpOracle {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: &str, model: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn analyze(&self, worker_id: &str, history: &[Observation]) -> Result<Verdict> {
        let history_json = serde_json::to_string(history)?;
        let body = json!({
            "contents": [{ "parts": [{ "text": build_prompt(&history_json) }] }],
            "generationConfig": { "responseMimeType": "application/json" },
        });

        let resp = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("oracle returned {}", status));
        }
        let parsed: GenerateResponse = resp.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| anyhow!("oracle response had no text"))?;

        let verdict = parse_verdict(&text)?;
        log(
            Level::Debug,
            Domain::Reasoning,
            "analyzed",
            obj(&[
                ("worker_id", v_str(worker_id)),
                ("model", v_str(&self.model)),
                ("points", json!(history.len())),
            ]),
        );
        Ok(verdict)
    }
}

// =============================================================================
// Local fallback
// =============================================================================

/// Rule-of-thumb oracle used when no model is configured: any presence in
/// the excavation pit is a likely intrusion, everything else is safe.
#[derive(Debug, Default, Clone)]
pub struct HeuristicOracle;

#[async_trait]
impl Oracle for HeuristicOracle {
    async fn analyze(&self, _worker_id: &str, history: &[Observation]) -> Result<Verdict> {
        if history.iter().any(|o| o.zone == Zone::ExcavationPit) {
            return Ok(Verdict {
                incident: true,
                reason: "Zone Intrusion: Excavation Pit".to_string(),
                confidence: 0.8,
            });
        }
        Ok(Verdict::safe("AI model not initialized"))
    }
}

/// Remote oracle when an API key is configured, heuristic otherwise.
pub fn oracle_from_config(cfg: &Config) -> Result<Arc<dyn Oracle>> {
    match &cfg.api_key {
        Some(key) => {
            let oracle = HttpOracle::new(&cfg.oracle_url, &cfg.oracle_model, key, cfg.oracle_timeout)?;
            log(
                Level::Info,
                Domain::Reasoning,
                "oracle",
                obj(&[("type", v_str("remote")), ("model", v_str(&cfg.oracle_model))]),
            );
            Ok(Arc::new(oracle))
        }
        None => {
            log(
                Level::Warn,
                Domain::Reasoning,
                "oracle",
                obj(&[("type", v_str("heuristic")), ("reason", v_str("no api key"))]),
            );
            Ok(Arc::new(HeuristicOracle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MotionStatus;
    use chrono::Utc;

    fn point(zone: Zone) -> Observation {
        Observation {
            id: "E1".to_string(),
            x: 10.0,
            y: 80.0,
            has_helmet: true,
            has_vest: true,
            zone,
            status: MotionStatus::Stationary,
            last_seen: Utc::now(),
            confidence: 0.9,
        }
    }

    struct Failing;

    #[async_trait]
    impl Oracle for Failing {
        async fn analyze(&self, _: &str, _: &[Observation]) -> Result<Verdict> {
            Err(anyhow!("connection refused"))
        }
    }

    struct Hanging;

    #[async_trait]
    impl Oracle for Hanging {
        async fn analyze(&self, _: &str, _: &[Observation]) -> Result<Verdict> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Verdict::safe("late"))
        }
    }

    #[test]
    fn parses_plain_json() {
        let v = parse_verdict(r#"{"incident": true, "reason": "no helmet", "confidence": 0.91}"#).unwrap();
        assert!(v.incident);
        assert_eq!(v.reason, "no helmet");
        assert_eq!(v.confidence, 0.91);
    }

    #[test]
    fn parses_fenced_json() {
        let text = "```json\n{\"incident\": false, \"reason\": \"Safe\", \"confidence\": 0.2}\n```";
        let v = parse_verdict(text).unwrap();
        assert!(!v.incident);
        assert_eq!(v.reason, "Safe");
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(parse_verdict("The worker looks fine.").is_err());
        assert!(parse_verdict(r#"{"reason": "x"}"#).is_err());
    }

    #[test]
    fn clamps_confidence() {
        let v = parse_verdict(r#"{"incident": true, "reason": "", "confidence": 7}"#).unwrap();
        assert_eq!(v.confidence, 1.0);
    }

    #[test]
    fn prompt_embeds_history_and_rules() {
        let p = build_prompt(r#"[{"id":"E1"}]"#);
        assert!(p.contains(r#"[{"id":"E1"}]"#));
        assert!(p.contains("Excavation Pit"));
        assert!(p.contains("\"incident\": boolean"));
    }

    #[tokio::test]
    async fn heuristic_flags_excavation_pit() {
        let o = HeuristicOracle;
        let v = o.analyze("E1", &[point(Zone::Safe), point(Zone::ExcavationPit)]).await.unwrap();
        assert!(v.incident);
        assert_eq!(v.confidence, 0.8);
        let v = o.analyze("E1", &[point(Zone::LoadingDock)]).await.unwrap();
        assert!(!v.incident);
    }

    #[tokio::test]
    async fn consult_defaults_on_error() {
        let v = consult(&Failing, "E1", &[], Duration::from_secs(1)).await;
        assert!(!v.incident);
        assert_eq!(v.confidence, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn consult_defaults_on_timeout() {
        let v = consult(&Hanging, "E1", &[], Duration::from_millis(50)).await;
        assert!(!v.incident);
        assert_eq!(v.reason, "Analysis timed out");
    }

    #[test]
    fn config_without_key_uses_heuristic() {
        let cfg = Config::default();
        assert!(oracle_from_config(&cfg).is_ok());
    }
}
