use std::sync::Arc;

use anyhow::Result;
use sentinel::agent::{AgentLoop, Capabilities};
use sentinel::broadcast::BroadcastHub;
use sentinel::config::Config;
use sentinel::incidents::IncidentStore;
use sentinel::logging::{log, obj, tick_aggregator, v_num, v_str, Domain, Level};
use sentinel::perception::SimulatedDetector;
use sentinel::reasoning::oracle_from_config;
use sentinel::video::StillFrameSource;
use sentinel::ws;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("descriptor", v_str(&cfg.source)),
            ("fps", json!(cfg.fps)),
            ("reason_every", json!(cfg.reason_every)),
            ("confidence_threshold", v_num(cfg.confidence_threshold)),
            ("data_dir", v_str(&cfg.data_dir.to_string_lossy())),
            ("ws_addr", v_str(&cfg.ws_addr)),
        ]),
    );

    let store = Arc::new(IncidentStore::open(&cfg.data_dir, cfg.incident_cap).await?);
    let hub = Arc::new(BroadcastHub::new(cfg.subscriber_buffer));

    let (stop_tx, stop_rx) = watch::channel(false);
    let listener = TcpListener::bind(&cfg.ws_addr).await?;
    let server = tokio::spawn(ws::serve(listener, hub.clone(), stop_rx));

    let caps = Capabilities {
        source: Arc::new(StillFrameSource::new(cfg.oracle_timeout)?),
        detector: Arc::new(SimulatedDetector::new(cfg.zones.clone())),
        oracle: oracle_from_config(&cfg)?,
    };
    let source = cfg.source.clone();
    let agent = AgentLoop::new(cfg, caps, store, hub);

    // a source that will not open is logged and leaves the server up
    if let Err(err) = agent.start(&source).await {
        log(
            Level::Error,
            Domain::System,
            "agent_not_started",
            obj(&[("descriptor", v_str(&source)), ("error", v_str(&err.to_string()))]),
        );
    }

    tokio::signal::ctrl_c().await?;
    log(Level::Info, Domain::System, "shutdown", obj(&[("signal", v_str("ctrl_c"))]));

    agent.stop().await;
    let _ = stop_tx.send(true);
    match server.await {
        Ok(Err(err)) => log(Level::Error, Domain::System, "ws_error", obj(&[("error", v_str(&format!("{:#}", err)))])),
        Err(err) => log(Level::Error, Domain::System, "ws_join", obj(&[("error", v_str(&err.to_string()))])),
        Ok(Ok(())) => {}
    }
    tick_aggregator();
    Ok(())
}
