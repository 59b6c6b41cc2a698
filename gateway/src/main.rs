#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use gateway_core::config::load_from_path;
use gateway_core::supervisor::Supervisor;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Protocol gateway bridging Modbus/CAN/serial devices to MQTT/InfluxDB/JSON")]
struct Cli {
    /// Path to the INI gateway configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.cfg")]
    config: PathBuf,

    /// Directory containing one subdirectory per protocol spec
    #[arg(long, value_name = "DIR", default_value = "protocols")]
    protocols: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            // Tracing isn't initialized yet when the config itself fails to
            // load, since the log level comes from that same config.
            eprintln!("failed to load configuration from {}: {err}", cli.config.display());
            std::process::exit(1);
        }
    };

    gateway_core::telemetry::init_tracing(&config.global.log_level, false);
    info!(transports = config.transports.len(), "configuration loaded");

    let mut supervisor = Supervisor::new(config);
    if let Err(err) = supervisor.build(&cli.protocols).await {
        error!(%err, "failed to build transports");
        std::process::exit(1);
    }

    if let Err(err) = supervisor.run().await {
        error!(%err, "gateway supervisor exited with error");
        std::process::exit(1);
    }
}
