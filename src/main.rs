// src/main.rs

//! The main entry point for the haproxy-cloud-discovery daemon.

use anyhow::Result;
use haproxy_cloud_discovery::config::{Config, LogFormat};
use haproxy_cloud_discovery::core::daemon::Daemon;
use std::env;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("haproxy-cloud-discovery {VERSION}");
        return Ok(());
    }

    // Required configuration path: -c/--config PATH.
    let config_path = args
        .iter()
        .position(|arg| arg == "-c" || arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let Some(config_path) = config_path else {
        eprintln!("Usage: haproxy-cloud-discovery -c /path/to/config.yaml [--once] [--validate]");
        std::process::exit(1);
    };

    let once = args.iter().any(|arg| arg == "--once");
    let validate_only = args.iter().any(|arg| arg == "--validate");

    // Load the configuration first; logging setup depends on it. A config
    // failure is fatal.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if validate_only {
        info!("Configuration is valid");
        return Ok(());
    }

    let mut daemon = match Daemon::new(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {e}");
            std::process::exit(1);
        }
    };

    if once {
        info!("Running single discovery cycle (--once)");
        if let Err(e) = daemon.run_once().await {
            error!("Cycle failed: {e}");
            std::process::exit(1);
        }
    } else if let Err(e) = daemon.run().await {
        error!("Daemon runtime error: {e}");
        std::process::exit(1);
    }

    Ok(())
}

/// Set up the global tracing subscriber: JSON or compact text on stderr,
/// level from the config unless RUST_LOG overrides it.
fn init_logging(config: &Config) {
    let default_directives = format!("{},hyper=warn,reqwest=warn", config.logging.level);
    let filter = EnvFilter::new(env::var("RUST_LOG").unwrap_or(default_directives));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}
