//! Command-line entry point arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "condor-bridge", version, about = "Condor soaring telemetry bridge")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "condor-bridge.toml")]
    pub config: PathBuf,

    /// Log level directive understood by `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Port for the Prometheus `/metrics` endpoint.
    #[arg(long, default_value_t = 9898)]
    pub metrics_port: u16,
}
