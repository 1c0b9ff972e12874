//! The agent control loop.
//!
//! ```text
//!  frame source ──► detector ──► memory ──► (every Nth cycle) oracle
//!                                   │                          │
//!                                   ▼                          ▼
//!                               timeline ◄──── incident ◄── decision filter
//!                                   │              │
//!                                   └──► snapshot ◄┘ ──► broadcast hub
//! ```
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`. At most
//! one cycle task exists per [`AgentLoop`]; `start` on a running loop stops
//! the previous run completely before the new one begins. Memory and
//! timeline live inside the cycle task and are never shared.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::BroadcastHub;
use crate::config::Config;
use crate::decision::DecisionFilter;
use crate::error::SentinelError;
use crate::incidents::IncidentStore;
use crate::logging::{
    agg_increment, log, log_fault, log_transition, log_verdict, obj, tick_aggregator, v_str, Domain, Level,
    ProfileScope,
};
use crate::memory::MemoryBank;
use crate::perception::Detector;
use crate::reasoning::{consult, Oracle};
use crate::timeline::GlobalTimeline;
use crate::types::{Frame, Observation, RunStats, SystemSnapshot, TimelineEvent};
use crate::video::{FrameSource, FrameStream, FrameThrottle, SourceDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
        }
    }
}

/// The external collaborators a run needs.
#[derive(Clone)]
pub struct Capabilities {
    pub source: Arc<dyn FrameSource>,
    pub detector: Arc<dyn Detector>,
    pub oracle: Arc<dyn Oracle>,
}

struct ActiveRun {
    descriptor: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct AgentLoop {
    cfg: Config,
    caps: Capabilities,
    store: Arc<IncidentStore>,
    hub: Arc<BroadcastHub>,
    state: Arc<watch::Sender<RunState>>,
    control: tokio::sync::Mutex<Option<ActiveRun>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl AgentLoop {
    pub fn new(cfg: Config, caps: Capabilities, store: Arc<IncidentStore>, hub: Arc<BroadcastHub>) -> Self {
        let (state, _) = watch::channel(RunState::Stopped);
        Self {
            cfg,
            caps,
            store,
            hub,
            state: Arc::new(state),
            control: tokio::sync::Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Reason the most recent `start` failed or the last run died, cleared
    /// by a successful start.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn store(&self) -> &Arc<IncidentStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Start a run on `descriptor`, stopping any current run first. Fails
    /// only if the source cannot be opened; the loop is then `Stopped`.
    pub async fn start(&self, descriptor: &str) -> Result<(), SentinelError> {
        let mut control = self.control.lock().await;
        if let Some(run) = control.take() {
            log(
                Level::Info,
                Domain::Agent,
                "restart",
                obj(&[("descriptor", v_str(&run.descriptor)), ("next", v_str(descriptor))]),
            );
            self.shutdown(run).await;
        }

        self.transition(RunState::Starting, descriptor);
        let (parsed, stream) = match self.open(descriptor).await {
            Ok(opened) => opened,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Agent,
                    "start_failed",
                    obj(&[("descriptor", v_str(descriptor)), ("error", v_str(&err.to_string()))]),
                );
                self.set_error(Some(err.to_string()));
                self.transition(RunState::Stopped, descriptor);
                return Err(err);
            }
        };

        self.set_error(None);
        self.transition(RunState::Running, descriptor);
        let (stop_tx, stop_rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            &self.cfg,
            self.caps.clone(),
            self.store.clone(),
            self.hub.clone(),
            parsed,
        );
        let task = tokio::spawn(supervise(
            pipeline.run(stream, stop_rx),
            self.state.clone(),
            self.last_error.clone(),
            descriptor.to_string(),
        ));
        *control = Some(ActiveRun {
            descriptor: descriptor.to_string(),
            stop_tx,
            task,
        });
        Ok(())
    }

    /// Stop the current run and wait for its cycle task to exit. No-op
    /// when nothing is running.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        if let Some(run) = control.take() {
            self.shutdown(run).await;
        }
    }

    async fn open(&self, descriptor: &str) -> Result<(SourceDescriptor, Box<dyn FrameStream>), SentinelError> {
        let parsed = SourceDescriptor::parse(descriptor)?;
        let stream = self
            .caps
            .source
            .acquire(&parsed)
            .await
            .map_err(|err| SentinelError::unavailable(descriptor, format!("{:#}", err)))?;
        Ok((parsed, stream))
    }

    async fn shutdown(&self, run: ActiveRun) {
        self.transition(RunState::Stopping, &run.descriptor);
        let _ = run.stop_tx.send(true);
        if let Err(err) = run.task.await {
            log_fault(Domain::Agent, "join", &err.to_string());
        }
        self.transition(RunState::Stopped, &run.descriptor);
    }

    fn transition(&self, to: RunState, descriptor: &str) {
        publish_state(&self.state, to, descriptor);
    }

    fn set_error(&self, err: Option<String>) {
        record_error(&self.last_error, err);
    }
}

fn publish_state(state: &watch::Sender<RunState>, to: RunState, descriptor: &str) {
    let from = state.send_replace(to);
    log_transition(from.as_str(), to.as_str(), descriptor);
}

fn record_error(slot: &Mutex<Option<String>>, err: Option<String>) {
    *slot.lock().unwrap_or_else(|p| p.into_inner()) = err;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs the cycle task. A panic that escapes it ends the run: the loop
/// reports `Stopped` and the panic becomes `last_error`.
async fn supervise<F>(
    run: F,
    state: Arc<watch::Sender<RunState>>,
    last_error: Arc<Mutex<Option<String>>>,
    descriptor: String,
) where
    F: std::future::Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(run).catch_unwind().await {
        let msg = format!("cycle task panicked: {}", panic_message(&*payload));
        agg_increment("fault");
        log(
            Level::Error,
            Domain::Agent,
            "run_aborted",
            obj(&[("descriptor", v_str(&descriptor)), ("error", v_str(&msg))]),
        );
        record_error(&last_error, Some(msg));
        publish_state(&state, RunState::Stopped, &descriptor);
    }
}

/// State owned by one run's cycle task.
struct Pipeline {
    cfg: Config,
    caps: Capabilities,
    store: Arc<IncidentStore>,
    hub: Arc<BroadcastHub>,
    descriptor: SourceDescriptor,
    memory: MemoryBank,
    timeline: GlobalTimeline,
    filter: DecisionFilter,
    reason_every: u64,
    cycle: u64,
    fps: f64,
    last_frame_at: Option<Instant>,
}

impl Pipeline {
    fn new(
        cfg: &Config,
        caps: Capabilities,
        store: Arc<IncidentStore>,
        hub: Arc<BroadcastHub>,
        descriptor: SourceDescriptor,
    ) -> Self {
        Self {
            memory: MemoryBank::new(cfg.history_capacity),
            timeline: GlobalTimeline::new(cfg.timeline_capacity),
            filter: DecisionFilter::new(cfg.confidence_threshold),
            reason_every: cfg.reason_every.max(1),
            cfg: cfg.clone(),
            caps,
            store,
            hub,
            descriptor,
            cycle: 0,
            fps: 0.0,
            last_frame_at: None,
        }
    }

    async fn run(mut self, mut stream: Box<dyn FrameStream>, mut stop: watch::Receiver<bool>) {
        let mut throttle = FrameThrottle::new(self.cfg.frame_interval());
        let descriptor = self.descriptor.to_string();
        log(
            Level::Info,
            Domain::Agent,
            "loop_started",
            obj(&[("descriptor", v_str(&descriptor))]),
        );

        loop {
            if *stop.borrow() {
                break;
            }
            let pulled = tokio::select! {
                biased;
                _ = stop.changed() => break,
                pulled = async {
                    throttle.wait().await;
                    stream.next_frame().await
                } => pulled,
            };

            match pulled {
                Ok(Some(frame)) => {
                    let fault = match AssertUnwindSafe(self.run_cycle(&frame)).catch_unwind().await {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Some(format!("{:#}", err)),
                        Err(payload) => Some(format!("panic: {}", panic_message(&*payload))),
                    };
                    if let Some(fault) = fault {
                        agg_increment("fault");
                        log_fault(Domain::Agent, "cycle", &fault);
                        if self.pause(&mut stop).await {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    log(
                        Level::Info,
                        Domain::Video,
                        "source_exhausted",
                        obj(&[("descriptor", v_str(&descriptor)), ("cycle", json!(self.cycle))]),
                    );
                    stream.release();
                    match self.reacquire(&mut stop).await {
                        Some(fresh) => stream = fresh,
                        None => break,
                    }
                }
                Err(err) => {
                    agg_increment("fault");
                    log_fault(Domain::Video, "next_frame", &format!("{:#}", err));
                    if self.pause(&mut stop).await {
                        break;
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        stream.release();
        let last = self.final_snapshot().await;
        self.hub.publish(&last);
        log(
            Level::Info,
            Domain::Agent,
            "loop_exited",
            obj(&[("descriptor", v_str(&descriptor)), ("cycles", json!(self.cycle))]),
        );
    }

    /// Sleep for the retry pause. Returns true if stop was requested.
    async fn pause(&self, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = stop.changed() => true,
            _ = tokio::time::sleep(self.cfg.retry_pause) => *stop.borrow(),
        }
    }

    /// Re-open the same descriptor after end of stream, retrying until it
    /// opens or the run is stopped.
    async fn reacquire(&self, stop: &mut watch::Receiver<bool>) -> Option<Box<dyn FrameStream>> {
        loop {
            if *stop.borrow() {
                return None;
            }
            match self.caps.source.acquire(&self.descriptor).await {
                Ok(stream) => {
                    log(
                        Level::Info,
                        Domain::Video,
                        "source_restarted",
                        obj(&[("descriptor", v_str(&self.descriptor.to_string()))]),
                    );
                    return Some(stream);
                }
                Err(err) => {
                    log_fault(Domain::Video, "reacquire", &format!("{:#}", err));
                    if self.pause(stop).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn run_cycle(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.measure_fps();

        let observations = {
            let _scope = ProfileScope::new("detect");
            self.caps.detector.detect(frame).await?
        };
        for obs in &observations {
            if let Some(change) = self.memory.update(obs.clone()) {
                self.timeline
                    .append(TimelineEvent::new(&obs.id, obs.last_seen, change.kind, change.description));
            }
        }

        if self.cycle % self.reason_every == 0 {
            self.reason(&observations, frame).await?;
        }

        let snapshot = self.snapshot(&observations).await;
        self.hub.publish(&snapshot);

        self.cycle += 1;
        agg_increment("cycle");
        tick_aggregator();
        Ok(())
    }

    async fn reason(&mut self, observations: &[Observation], frame: &Frame) -> anyhow::Result<()> {
        for obs in observations {
            let history = self.memory.windowed_history(&obs.id, self.cfg.window);
            if history.len() < self.cfg.min_history {
                continue;
            }
            let verdict = consult(self.caps.oracle.as_ref(), &obs.id, &history, self.cfg.oracle_timeout).await;
            let accepted = self.filter.evaluate(&verdict, obs);
            log_verdict(&obs.id, verdict.incident, verdict.confidence, &verdict.reason, accepted.is_some());

            if let Some(incident) = accepted {
                let stored = self.store.append(incident, &frame.data).await?;
                agg_increment("incident");
                self.timeline.append(TimelineEvent::violation(&stored));
            }
        }
        Ok(())
    }

    fn measure_fps(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last_frame_at {
            let dt = now.duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                let inst = 1.0 / dt;
                self.fps = if self.fps == 0.0 { inst } else { 0.8 * self.fps + 0.2 * inst };
            }
        }
        self.last_frame_at = Some(now);
    }

    async fn snapshot(&self, observations: &[Observation]) -> SystemSnapshot {
        SystemSnapshot {
            workers: observations.to_vec(),
            incidents: self.store.recent(self.cfg.recent_incidents).await,
            timeline: self.timeline.snapshot(),
            stats: RunStats {
                fps: (self.fps * 100.0).round() / 100.0,
                active_workers: observations.len(),
                system_status: "Autonomous".to_string(),
                cycle: self.cycle,
            },
        }
    }

    async fn final_snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            workers: Vec::new(),
            incidents: self.store.recent(self.cfg.recent_incidents).await,
            timeline: self.timeline.snapshot(),
            stats: RunStats {
                fps: 0.0,
                active_workers: 0,
                system_status: "Stopped".to_string(),
                cycle: self.cycle,
            },
        }
    }
}
