use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

use minutier::app::Service;
use minutier::cli::Cli;
use minutier::config::Config;
use minutier::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = logging::init(&config.logging, cli.log_level.as_deref()) {
        eprintln!("Logging setup failed: {err:#}");
        return ExitCode::from(1);
    }

    info!("Starting Minutier {}", env!("CARGO_PKG_VERSION"));

    let service = match Service::build(config) {
        Ok(service) => service,
        Err(err) => {
            error!("Startup failed: {err:#}");
            return ExitCode::from(1);
        }
    };

    match service.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Service terminated unexpectedly: {err:#}");
            ExitCode::from(2)
        }
    }
}
