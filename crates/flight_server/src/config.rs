//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default values
//! used to initialize and customize the flight server core. Durations are kept
//! as plain millisecond/second integers so the structures serialize cleanly to
//! TOML; accessor methods convert them to [`Duration`].

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Configuration structure for the flight server.
///
/// Contains all necessary parameters to configure server behavior including
/// network settings, pipeline queue sizing, the logic pool, supervision
/// timeouts and routing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Idle timeout in seconds before a silent connection is dropped
    pub connection_timeout: u64,

    /// Pipeline queue and framing settings
    pub pipeline: PipelineConfig,

    /// Logic-stage worker pool settings
    pub pool: PoolConfig,

    /// Stage supervision settings
    pub supervisor: SupervisorConfig,

    /// Routing defaults
    pub router: RouterConfig,

    /// Security configuration settings
    pub security: SecurityConfig,
}

/// Queue depths and framing limits for the stage chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each bounded hand-off queue between stages
    pub queue_depth: usize,

    /// Largest accepted frame in bytes; larger frames close the connection
    pub max_frame_size: usize,

    /// Interval at which batched outbound frames are flushed, in milliseconds
    pub batch_interval_ms: u64,

    /// How often the idle sweep looks for timed out connections, in milliseconds
    pub idle_sweep_interval_ms: u64,

    /// Longest a single socket write may take before the connection is dropped, in milliseconds
    pub write_timeout_ms: u64,
}

/// Sizing and backlog policy for the queueing pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name used as the worker thread name prefix
    pub name: String,

    /// Threads kept alive even when idle
    pub core_threads: usize,

    /// Upper bound on worker threads
    pub max_threads: usize,

    /// Capacity of the primary queue
    pub primary_capacity: usize,

    /// Idle time after which threads above core retire, in milliseconds
    pub keep_alive_ms: u64,

    /// Overflow size above which the backlog may escalate
    pub backlog_escalate_size: usize,

    /// Oldest-entry wait above which the backlog may escalate, in milliseconds
    pub backlog_escalate_wait_ms: u64,

    /// Minimum spacing between light backlog warnings, in milliseconds
    pub backlog_warn_interval_ms: u64,

    /// Bounded wait for worker threads during shutdown, in milliseconds
    pub shutdown_timeout_ms: u64,
}

/// Timeouts used by the stage supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between health sweeps, in milliseconds
    pub sweep_interval_ms: u64,

    /// Continuous execution time after which a stage counts as hung, in milliseconds
    pub hang_threshold_ms: u64,

    /// Bounded wait for a stage task to finish after interrupt or abort, in milliseconds
    pub join_timeout_ms: u64,
}

/// Defaults applied by the router when a client does not specify its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Proximity range for traffic updates in nautical miles
    pub default_range_nm: f64,

    /// Maximum number of aircraft sent in an initial traffic snapshot
    pub default_max_aircraft: usize,

    /// Service range assumed for dispatchers that have not set one
    pub default_dispatch_range_nm: f64,
}

/// Security configuration for connection admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Banned IP addresses
    pub banned_ips: Vec<IpAddr>,

    /// Maximum concurrent connections per IP
    pub max_connections_per_ip: u32,
}

impl ServerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

impl PipelineConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn backlog_escalate_wait(&self) -> Duration {
        Duration::from_millis(self.backlog_escalate_wait_ms)
    }

    pub fn backlog_warn_interval(&self) -> Duration {
        Duration::from_millis(self.backlog_warn_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl SupervisorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn hang_threshold(&self) -> Duration {
        Duration::from_millis(self.hang_threshold_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 14_000)),
            max_connections: 2000,
            connection_timeout: 180,
            pipeline: PipelineConfig::default(),
            pool: PoolConfig::default(),
            supervisor: SupervisorConfig::default(),
            router: RouterConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 512,
            max_frame_size: 64 * 1024, // 64KB
            batch_interval_ms: 50,
            idle_sweep_interval_ms: 5_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            name: String::from("logic"),
            core_threads: cpus,
            max_threads: cpus * 2,
            primary_capacity: 4,
            keep_alive_ms: 30_000,
            backlog_escalate_size: 40,
            backlog_escalate_wait_ms: 1_500,
            backlog_warn_interval_ms: 2_500,
            shutdown_timeout_ms: 1_500,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            hang_threshold_ms: 60_000,
            join_timeout_ms: 1_500,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_range_nm: 40.0,
            default_max_aircraft: 100,
            default_dispatch_range_nm: 500.0,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            banned_ips: Vec::new(),
            max_connections_per_ip: 10,
        }
    }
}
