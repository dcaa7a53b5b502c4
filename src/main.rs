use anyhow::Context;
use clap::Parser;
use condor_bridge::cli::Cli;
use condor_bridge::config::Config;
use condor_bridge::orchestrator::Orchestrator;
use condor_bridge::{metrics, telemetry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level);

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("failed to load {}: {e}, using defaults", cli.config.display());
            Config::default()
        }
    };

    let problems = config.validate();
    if !problems.is_empty() {
        for (section, messages) in &problems {
            for message in messages {
                warn!(section, message, "configuration problem");
            }
        }
    }

    metrics::initialize_bridge_metrics();
    tokio::spawn(metrics::start_metrics_server(cli.metrics_port));

    let mut orchestrator = Orchestrator::new(config);
    orchestrator.start().await;
    info!("condor-bridge running, press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    orchestrator.stop().await;
    Ok(())
}
