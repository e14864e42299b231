//! Health checks and metrics export for production deployment.

use crate::connection::RoleCounts;
use crate::pipeline::{BandwidthStats, DecodeStats};
use crate::pool::PoolStats;
use crate::router::RouterStats;
use crate::security::SecurityStats;
use crate::server::FlightServer;
use crate::supervisor::StageReport;
use crate::worker::ExecutionState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Everything the server exposes for monitoring, collected at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub uptime_seconds: u64,
    pub max_connections: usize,
    pub connections: RoleCounts,
    pub stages: Vec<StageReport>,
    pub stage_restarts: u64,
    pub pool: PoolStats,
    pub router: RouterStats,
    pub bandwidth: BandwidthStats,
    pub decode: DecodeStats,
    pub security: SecurityStats,
}

/// Overall health status of the server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value used in the Prometheus export.
    pub fn gauge(self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        }
    }
}

/// Health check result containing system status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub stages_alive: usize,
    pub stages_total: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Share of `max_connections` above which the server reports degraded.
pub const CONNECTION_WARN_RATIO: f64 = 0.9;

/// Derives a health report from a metrics snapshot.
pub fn assess(metrics: &ServerMetrics) -> HealthReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut stages_alive = 0;
    for stage in &metrics.stages {
        if stage.alive {
            stages_alive += 1;
        } else if stage.status.state != ExecutionState::Shutdown {
            errors.push(format!("Stage '{}' is down", stage.name));
        }
    }

    if metrics.stage_restarts > 0 {
        warnings.push(format!("{} stage restart(s) since start", metrics.stage_restarts));
    }

    if metrics.pool.overflow_queued > 0 {
        warnings.push(format!(
            "Logic pool backlog: {} queued, oldest waiting {}ms",
            metrics.pool.overflow_queued, metrics.pool.oldest_overflow_wait_ms
        ));
    }

    let active = metrics.connections.total();
    if metrics.max_connections > 0 {
        let limit = metrics.max_connections as f64 * CONNECTION_WARN_RATIO;
        if active as f64 >= limit {
            warnings.push(format!(
                "Near connection limit: {}/{}",
                active, metrics.max_connections
            ));
        }
    }

    let status = if !errors.is_empty() {
        HealthStatus::Unhealthy
    } else if !warnings.is_empty() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthReport {
        status,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        uptime_seconds: metrics.uptime_seconds,
        active_connections: active,
        stages_alive,
        stages_total: metrics.stages.len(),
        errors,
        warnings,
    }
}

fn gauge(out: &mut String, name: &str, help: &str, kind: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Renders metrics in the Prometheus text exposition format.
pub fn render_prometheus(metrics: &ServerMetrics, report: &HealthReport) -> String {
    let mut out = String::new();

    gauge(&mut out, "skyrelay_health", "Overall server health status", "gauge", report.status.gauge());
    gauge(&mut out, "skyrelay_uptime_seconds", "Server uptime in seconds", "counter", metrics.uptime_seconds);

    let _ = writeln!(out, "# HELP skyrelay_connections Live connections per role");
    let _ = writeln!(out, "# TYPE skyrelay_connections gauge");
    let roles = [
        ("unidentified", metrics.connections.unidentified),
        ("pilot", metrics.connections.pilots),
        ("dispatcher", metrics.connections.dispatchers),
        ("atc", metrics.connections.atc),
        ("viewer", metrics.connections.viewers),
    ];
    for (role, count) in roles {
        let _ = writeln!(out, "skyrelay_connections{{role=\"{role}\"}} {count}");
    }

    let _ = writeln!(out, "# HELP skyrelay_stage_executed_total Units of work executed per stage");
    let _ = writeln!(out, "# TYPE skyrelay_stage_executed_total counter");
    for stage in &metrics.stages {
        let _ = writeln!(
            out,
            "skyrelay_stage_executed_total{{stage=\"{}\"}} {}",
            stage.name, stage.status.executed
        );
    }
    let _ = writeln!(out, "# HELP skyrelay_stage_restarts_total Restarts per stage");
    let _ = writeln!(out, "# TYPE skyrelay_stage_restarts_total counter");
    for stage in &metrics.stages {
        let _ = writeln!(out, "skyrelay_stage_restarts_total{{stage=\"{}\"}} {}", stage.name, stage.restarts);
    }
    let _ = writeln!(out, "# HELP skyrelay_stage_latency_avg_us Average recent execution latency per stage");
    let _ = writeln!(out, "# TYPE skyrelay_stage_latency_avg_us gauge");
    for stage in &metrics.stages {
        if let Some(avg) = stage.status.avg_latency_us {
            let _ = writeln!(out, "skyrelay_stage_latency_avg_us{{stage=\"{}\"}} {}", stage.name, avg);
        }
    }

    gauge(&mut out, "skyrelay_pool_threads", "Logic pool threads", "gauge", metrics.pool.threads);
    gauge(&mut out, "skyrelay_pool_overflow_queued", "Tasks waiting in the overflow queue", "gauge", metrics.pool.overflow_queued);
    gauge(&mut out, "skyrelay_pool_completed_total", "Tasks completed by the logic pool", "counter", metrics.pool.completed);
    gauge(&mut out, "skyrelay_pool_panicked_total", "Tasks that panicked on the logic pool", "counter", metrics.pool.panicked);
    gauge(&mut out, "skyrelay_pool_escalations_total", "Backlog escalations", "counter", metrics.pool.escalations);

    gauge(&mut out, "skyrelay_messages_handled_total", "Client messages handled", "counter", metrics.router.handled);
    gauge(&mut out, "skyrelay_messages_rejected_total", "Client messages answered with an error", "counter", metrics.router.rejected);
    gauge(&mut out, "skyrelay_messages_delivered_total", "Messages queued for delivery", "counter", metrics.router.delivered);
    gauge(&mut out, "skyrelay_routing_misses_total", "Messages addressed to departed connections", "counter", metrics.router.routing_misses);
    gauge(&mut out, "skyrelay_persistence_failures_total", "Failed store transactions", "counter", metrics.router.persistence_failures);
    gauge(&mut out, "skyrelay_frames_malformed_total", "Inbound frames that failed to decode", "counter", metrics.decode.malformed);

    gauge(&mut out, "skyrelay_bytes_out_total", "Bytes written to clients", "counter", metrics.bandwidth.bytes_out);
    gauge(&mut out, "skyrelay_bytes_out_per_second", "Outbound byte rate", "gauge", metrics.bandwidth.bytes_per_sec);

    gauge(&mut out, "skyrelay_refused_connections_total", "Connections refused at accept", "counter", metrics.security.refused_connections);
    gauge(&mut out, "skyrelay_banned_ips", "Banned IP addresses", "gauge", metrics.security.banned_ips);

    out
}

/// Health check manager for monitoring server status
#[derive(Debug, Default)]
pub struct HealthManager {
    last_health_check: RwLock<Option<HealthReport>>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs a full health check of the server and caches the result.
    pub fn perform_health_check(&self, server: &FlightServer) -> HealthReport {
        let report = assess(&server.metrics());
        *self.last_health_check.write() = Some(report.clone());
        report
    }

    pub fn last_health_check(&self) -> Option<HealthReport> {
        self.last_health_check.read().clone()
    }

    /// Liveness: the process is able to answer at all.
    pub fn liveness_check(&self) -> bool {
        true
    }

    /// Readiness: the server is listening and every stage is alive.
    pub fn readiness_check(&self, server: &FlightServer) -> bool {
        server.local_addr().is_some() && server.metrics().stages.iter().all(|s| s.alive)
    }

    /// Gets health metrics in Prometheus format
    pub fn prometheus_metrics(&self, server: &FlightServer) -> String {
        let metrics = server.metrics();
        let report = assess(&metrics);
        *self.last_health_check.write() = Some(report.clone());
        render_prometheus(&metrics, &report)
    }
}
