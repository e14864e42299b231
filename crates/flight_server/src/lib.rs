//! # Flight Server - Real-Time Core of SkyRelay
//!
//! The real-time core of a flight-simulation network service. Pilots,
//! dispatchers, air traffic controllers and spectators connect over TCP; the
//! server keeps their sessions, relays aircraft positions to whoever is
//! nearby, and runs two small binding protocols between connections.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Pipeline** - a chain of stages connected by bounded queues: accept,
//!   read, decode, logic, enrich, serialize, bandwidth and write, plus an
//!   idle sweep that times out silent connections
//! * **Supervisor** - runs one task per stage, restarts crashed or hung
//!   stages on the same worker instance and drives ordered shutdown
//! * **Queueing Pool** - bounded OS-thread executor for the routing logic
//!   that degrades into an ordered overflow queue instead of rejecting work
//! * **Connection Registry** - every live connection with role and proximity
//!   queries and compare-and-swap binding entry points
//! * **Router** - one handler per client message type
//!
//! ### Message Flow
//!
//! 1. The read stage cuts length-prefixed frames off each socket
//! 2. The decode stage decompresses and decodes them into an [`Envelope`](messaging::Envelope)
//! 3. The logic stage runs the router on the pool, one lane per connection
//! 4. Router output is enriched, serialized per recipient, metered and
//!    written out in batches
//!
//! ### Binding Protocols
//!
//! * **Dispatch service** - a pilot's request is offered to every available
//!   dispatcher in range; the first accept wins
//! * **Flight viewing** - a spectator follows one pilot and from then on is
//!   the only recipient of that pilot's traffic
//!
//! ## Configuration
//!
//! The server is configured through [`ServerConfig`]: network settings,
//! pipeline queue depths and framing limits, the logic pool, supervision
//! timeouts, routing defaults and admission control.
//!
//! ## Error Handling
//!
//! Nothing a client sends is fatal. Stage failures restart the stage,
//! routing failures become negative acknowledgements, and persistence
//! failures roll back and are reported to the requester.

// Re-export core types and functions for easy access
pub use config::ServerConfig;
pub use error::ServerError;
pub use health::{HealthManager, HealthReport, HealthStatus, ServerMetrics};
pub use server::FlightServer;
pub use utils::{create_server, create_server_with_config, current_timestamp_ms};

// Public module declarations
pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod geo;
pub mod health;
pub mod messaging;
pub mod pipeline;
pub mod pool;
pub mod router;
pub mod security;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod worker;
