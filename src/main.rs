//! Forex Exporter
//!
//! Polls exchange rates for the configured currency pairs and serves the
//! latest value of each as Prometheus metrics.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Forex Exporter                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │     Poll     │───▶│    Metric    │◀───│   Metrics    │       │
//! │  │  Scheduler   │    │   Registry   │    │    Server    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use forex_exporter::adapters::build_source;
use forex_exporter::config::Args;
use forex_exporter::error::Result;
use forex_exporter::{ForexMetrics, MetricsServer, PollScheduler, ShutdownCoordinator};

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.log_json);

    let config = args.into_config().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    info!("Starting Forex Exporter");
    info!("  Source: {}", config.source.name);
    info!(
        "  Currency pairs: {}",
        config
            .currency_pairs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("  Listen address: {}", config.listen);

    let source = build_source(&config.source)?;
    let metrics = Arc::new(ForexMetrics::new()?);
    let coordinator = ShutdownCoordinator::new(config.grace_period);

    // Start metrics server
    let (server, server_failures) =
        MetricsServer::bind(&config.listen, Arc::clone(&metrics), config.grace_period)
            .await
            .map_err(|e| {
                error!("Failed to start metrics server: {}, cannot continue", e);
                e
            })?;
    coordinator.track("metrics-server", server.start(coordinator.token()));

    // Start rate polling
    let scheduler = PollScheduler::new(
        config.currency_pairs.clone(),
        Arc::clone(&metrics),
        config.grace_period,
    );
    let scheduler_handle = match scheduler.start(source, coordinator.token()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(
                "Error starting {} rate source: {}, cannot continue",
                config.source.name, e
            );
            if let Err(shutdown_err) = coordinator.shutdown().await {
                error!("{}", shutdown_err);
            }
            return Err(e);
        }
    };
    coordinator.track("poll-scheduler", scheduler_handle);

    coordinator
        .run_until(coordinator.wait_for_signal(), server_failures)
        .await?;

    info!("Forex Exporter shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, log_json: bool) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
