//! Market data publisher - preflight / replay entry point
//!
//! Loads the node's publication config, brings up logging and the
//! configured sinks, optionally pushes a number of empty blocks through
//! the pipeline, then shuts everything down in order:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│  Sinks   │───▶│ Pipeline │───▶│   Stop   │
//! │  (YAML)  │    │(bus/file)│    │ (blocks) │    │ (drain)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `marketdata_pub [--env dev | --config path.yaml] [--blocks N] [--start-height H]`

use std::process::ExitCode;

use chrono::Utc;
use marketdata_pub::config::AppConfig;
use marketdata_pub::pipeline::MarketDataPipeline;
use marketdata_pub::sink::build_sink;
use marketdata_pub::snapshot::SettlementOutputs;

// ============================================================
// ARGUMENTS
// ============================================================

fn arg_value(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn load_config() -> Result<AppConfig, marketdata_pub::config::ConfigError> {
    match arg_value(&["--config", "-c"]) {
        Some(path) => AppConfig::load(path),
        None => AppConfig::load_env(&arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())),
    }
}

// ============================================================
// MAIN
// ============================================================

fn main() -> ExitCode {
    let app_config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = marketdata_pub::logging::init_logging(&app_config.log);

    let blocks: i64 = arg_value(&["--blocks"])
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let start_height: i64 = arg_value(&["--start-height"])
        .and_then(|v| v.parse().ok())
        .unwrap_or(app_config.publication.from_height_inclusive.max(1));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        blocks,
        start_height,
        "Starting market data publisher"
    );

    let publication = app_config.publication;
    if !publication.should_publish_any() {
        tracing::warn!("Nothing to publish: every family or every sink is disabled");
        return ExitCode::SUCCESS;
    }

    let sink = match build_sink(&publication) {
        Ok(sink) => sink,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up sinks");
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut pipeline = match MarketDataPipeline::start(publication, sink) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start pipeline");
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut exit = ExitCode::SUCCESS;
    for height in start_height..start_height + blocks {
        let timestamp = Utc::now().timestamp_millis();
        if let Err(e) = pipeline.assemble_and_enqueue(height, timestamp, SettlementOutputs::default()) {
            tracing::error!(height, error = %e, "Failed to enqueue block");
            exit = ExitCode::FAILURE;
            break;
        }
    }

    if let Err(e) = pipeline.stop() {
        tracing::error!(error = %e, "Pipeline stopped with error");
        exit = ExitCode::FAILURE;
    }
    println!("{}", pipeline.metrics());
    exit
}
