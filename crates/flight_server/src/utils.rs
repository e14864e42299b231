//! Utility functions and helper methods for the flight server.
//!
//! This module provides convenience functions for creating server instances
//! and other common operations.

use crate::{config::ServerConfig, server::FlightServer};
use std::time::{SystemTime, UNIX_EPOCH};

/// Creates a new flight server with default configuration.
///
/// Binds to `127.0.0.1:14000` with the default pipeline, pool and
/// supervision settings, the JSON codec, an in-memory store and the trusting
/// authenticator.
pub fn create_server() -> FlightServer {
    FlightServer::new(ServerConfig::default())
}

/// Creates a new flight server with custom configuration.
pub fn create_server_with_config(config: ServerConfig) -> FlightServer {
    FlightServer::new(config)
}

/// Milliseconds since the Unix epoch; zero if the clock is before it.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
