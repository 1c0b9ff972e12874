//! Offline analysis of a finite source.
//!
//! Runs every frame through the detector once, as fast as the source and
//! detector allow, and collects the per-frame observations. No memory,
//! reasoning, or persistence is involved.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::logging::{log, obj, v_num, v_str, Domain, Level, ProfileScope};
use crate::perception::Detector;
use crate::types::Observation;
use crate::video::{FrameSource, SourceDescriptor};

/// Frames past this many are refused, so an unbounded source cannot be
/// mistaken for a batch.
pub const MAX_BATCH_FRAMES: usize = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameResult {
    pub frame: u64,
    /// Seconds since the first frame at the nominal frame rate.
    pub timestamp: f64,
    pub workers: Vec<Observation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub total_frames: usize,
    pub duration: f64,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub frames: Vec<FrameResult>,
    pub metadata: BatchMetadata,
}

impl BatchReport {
    /// Distinct worker ids seen anywhere in the batch, in first-seen order.
    pub fn worker_ids(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for f in &self.frames {
            for w in &f.workers {
                if !seen.iter().any(|s| s == &w.id) {
                    seen.push(w.id.clone());
                }
            }
        }
        seen
    }
}

pub async fn process_source(
    source: &dyn FrameSource,
    descriptor: &str,
    detector: &dyn Detector,
    nominal_fps: f64,
) -> Result<BatchReport> {
    let _scope = ProfileScope::with_context("batch", &[("descriptor", v_str(descriptor))]);
    let parsed = SourceDescriptor::parse(descriptor)?;
    let mut stream = source
        .acquire(&parsed)
        .await
        .with_context(|| format!("opening {}", descriptor))?;
    let fps = if nominal_fps > 0.0 { nominal_fps } else { 1.0 };

    let mut frames = Vec::new();
    let outcome = loop {
        let frame = match stream.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        if frames.len() >= MAX_BATCH_FRAMES {
            break Err(anyhow::anyhow!("{} yielded more than {} frames", descriptor, MAX_BATCH_FRAMES));
        }
        let workers = match detector.detect(&frame).await {
            Ok(workers) => workers,
            Err(err) => break Err(err),
        };
        let index = frames.len() as u64;
        frames.push(FrameResult {
            frame: index,
            timestamp: index as f64 / fps,
            workers,
        });
    };
    stream.release();
    outcome?;

    if frames.is_empty() {
        bail!("{} produced no frames", descriptor);
    }
    let metadata = BatchMetadata {
        total_frames: frames.len(),
        duration: frames.len() as f64 / fps,
        processed_at: Utc::now(),
    };
    log(
        Level::Info,
        Domain::Video,
        "batch_processed",
        obj(&[
            ("descriptor", v_str(descriptor)),
            ("frames", json!(metadata.total_frames)),
            ("duration", v_num(metadata.duration)),
        ]),
    );
    Ok(BatchReport { frames, metadata })
}
