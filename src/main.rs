//! chat-relay: relay every received chunk to the connected clients.
//!
//! Configuration via CLI arguments or TOML file; Ctrl-C stops the server.

use chat_relay::{Config, Server};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    for warning in &config.warnings {
        warn!("{warning}");
    }

    info!(
        host = %config.host,
        port = config.port,
        threads = config.threads,
        buffer_size = config.buffer_size,
        broadcast = ?config.broadcast,
        "Starting chat-relay"
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), chat_relay::ServerError> {
    let mut server = Server::new(config.clone());

    let stop = server.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.stop()) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    server.initialize()?;
    server.start_listening(&config.host, config.port)?;
    server.run(config.threads)?;
    server.shutdown();
    Ok(())
}
