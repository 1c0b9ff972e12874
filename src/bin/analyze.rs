use std::env;
use std::time::Duration;

use sentinel::batch::process_source;
use sentinel::config::Config;
use sentinel::perception::SimulatedDetector;
use sentinel::video::StillFrameSource;

/// Runs a finite source through the detector once and prints the report as JSON.
#[tokio::main]
async fn main() {
    let cfg = Config::from_env();
    let descriptor = env::args().nth(1).unwrap_or_else(|| cfg.source.clone());
    let nominal_fps = env::var("BATCH_FPS")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(30.0);

    let source = match StillFrameSource::new(Duration::from_secs(10)) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("cannot build frame source: {:#}", err);
            std::process::exit(1);
        }
    };
    let detector = SimulatedDetector::new(cfg.zones.clone());

    let report = match process_source(&source, &descriptor, &detector, nominal_fps).await {
        Ok(r) => r,
        Err(err) => {
            eprintln!("batch failed: {:#}", err);
            std::process::exit(2);
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(text) => println!("{}", text),
        Err(err) => {
            eprintln!("cannot encode report: {}", err);
            std::process::exit(3);
        }
    }
}
