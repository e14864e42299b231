//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that starts the flight
//! server, reports its health periodically and shuts it down in order when a
//! termination signal arrives.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::{wait_for_shutdown_signal, wait_for_shutdown_signal_silent},
};
use flight_server::{FlightServer, HealthManager, HealthReport, HealthStatus, ServerMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Bytes per second of outbound traffic above which a stats line is flagged.
const HIGH_TRAFFIC_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;

/// Applies command-line overrides on top of the file configuration.
pub fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(bind_address) = &args.bind_address {
        config.server.bind_address = bind_address.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if let Some(max_connections) = args.max_connections {
        config.server.max_connections = max_connections;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

/// Owns the flight server for the lifetime of the process.
pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    config_path: PathBuf,
    server: Arc<FlightServer>,
    health: Arc<HealthManager>,
}

impl Application {
    /// Validates the merged configuration and builds the server.
    ///
    /// # Process
    ///
    /// 1. Validate merged configuration
    /// 2. Display startup banner
    /// 3. Build the flight server from the converted configuration
    pub fn new(config: AppConfig, config_path: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();

        let server = FlightServer::new(config.to_server_config()?);
        info!("📂 Config: {}", config_path.display());

        Ok(Self {
            config,
            config_path,
            server: Arc::new(server),
            health: Arc::new(HealthManager::new()),
        })
    }

    pub fn server(&self) -> &Arc<FlightServer> {
        &self.server
    }

    /// Runs the server until a termination signal arrives, then shuts down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting SkyRelay");
        self.log_configuration_summary();

        self.server.start().await?;
        let monitor = self.spawn_monitor();

        info!("✅ SkyRelay is now running!");
        if let Some(addr) = self.server.local_addr() {
            info!("✈️ Ready to accept connections on {}", addr);
        }
        if monitor.is_some() {
            info!(
                "🔍 Health monitoring active - stats every {} seconds",
                self.config.monitoring.stats_interval_secs
            );
        }
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        wait_for_shutdown_signal().await?;

        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal_silent().await {
                error!("Failed to set up forced shutdown signal handler: {e}");
                return;
            }
            warn!("Shutdown signal received again! Exiting immediately.");
            std::process::exit(1);
        });

        self.shutdown(monitor).await;
        Ok(())
    }

    /// Starts periodic stats logging, unless disabled.
    pub fn spawn_monitor(&self) -> Option<JoinHandle<()>> {
        let every = self.config.monitoring.stats_interval_secs;
        if every == 0 {
            return None;
        }

        let server = self.server.clone();
        let health = self.health.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(every));
            // The first tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = health.perform_health_check(&server);
                log_statistics(&server.metrics(), &report);
            }
        }))
    }

    /// Stops monitoring, then the server, within the configured bound.
    pub async fn shutdown(&self, monitor: Option<JoinHandle<()>>) {
        info!("🛑 Shutdown signal received, beginning graceful shutdown...");

        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let limit = Duration::from_secs(self.config.monitoring.shutdown_timeout_secs.max(1));
        info!("⏳ Stopping pipeline stages...");
        if tokio::time::timeout(limit, self.server.stop()).await.is_err() {
            warn!("⏰ Server did not stop within {:?}, proceeding with exit", limit);
        }

        info!("📊 Final Statistics:");
        let metrics = self.server.metrics();
        info!("  - Uptime: {}s", metrics.uptime_seconds);
        info!("  - Messages handled: {}", metrics.router.handled);
        info!("  - Messages delivered: {}", metrics.router.delivered);
        info!("  - Bytes sent: {}", metrics.bandwidth.bytes_out);
        info!("  - Stage restarts: {}", metrics.stage_restarts);
        info!("  - Refused connections: {}", metrics.security.refused_connections);

        info!("✅ SkyRelay shutdown complete");
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  📂 Config file: {}", self.config_path.display());
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  ⏱️ Connection timeout: {}s", self.config.server.connection_timeout);
        info!(
            "  🧵 Logic pool: {}-{} threads",
            self.config.pool.core_threads, self.config.pool.max_threads
        );
        info!(
            "  📡 Traffic range: {}nm, dispatch range: {}nm",
            self.config.routing.default_range_nm, self.config.routing.default_dispatch_range_nm
        );
        if !self.config.security.banned_ips.is_empty() {
            info!("  🚫 Banned addresses: {}", self.config.security.banned_ips.len());
        }
    }
}

/// Writes one periodic stats line plus any health findings.
pub fn log_statistics(metrics: &ServerMetrics, report: &HealthReport) {
    let connections = &metrics.connections;
    info!(
        "📊 Server Health - {:?} | {} connections ({} pilots, {} dispatchers, {} atc, {} viewers) | {} B/s out | {} overflowed | {} restarts",
        report.status,
        connections.total(),
        connections.pilots,
        connections.dispatchers,
        connections.atc,
        connections.viewers,
        metrics.bandwidth.bytes_per_sec,
        metrics.pool.overflow_queued,
        metrics.stage_restarts,
    );

    if metrics.bandwidth.bytes_per_sec > HIGH_TRAFFIC_BYTES_PER_SEC as f64 {
        info!("🔥 High traffic - {} B/s outbound", metrics.bandwidth.bytes_per_sec);
    }

    match report.status {
        HealthStatus::Healthy => {}
        HealthStatus::Degraded => {
            for warning in &report.warnings {
                warn!("⚠️ {}", warning);
            }
        }
        HealthStatus::Unhealthy => {
            for problem in &report.errors {
                error!("❌ {}", problem);
            }
        }
    }
}
