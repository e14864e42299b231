//! # SkyRelay Server - Main Entry Point
//!
//! Real-time relay server for flight-simulation networks. This entry point
//! handles CLI parsing, configuration loading, logging setup and the
//! application lifecycle; the server itself lives in `flight_server`.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! skyrelay
//!
//! # Specify custom configuration
//! skyrelay --config production.toml
//!
//! # Override specific settings
//! skyrelay --bind 0.0.0.0:14000 --max-connections 5000 --log-level debug
//!
//! # JSON logging for production
//! skyrelay --json-logs
//! ```
//!
//! ## Configuration
//!
//! The server loads configuration from a TOML file (default: `skyrelay.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! SIGINT or SIGTERM stops the pipeline stages in order and drops every
//! connection. A second signal exits immediately.

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

use app::{apply_overrides, Application};
use cli::CliArgs;

pub use config::{AppConfig, ConfigError, LoggingSettings, MonitoringSettings, ServerSettings};

/// Runs the server from the process arguments.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
///
/// Must be called from within a tokio runtime.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut config = match AppConfig::load_from_file(&args.config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load {}: {e}", args.config_path.display());
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &args);

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(config, args.config_path) {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}
