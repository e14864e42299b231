//! Connection state and the connection registry.
//!
//! This module tracks every live client connection: who is behind it, what
//! role it plays, where it is, and which other connections it is bound to.
//! The [`ConnectionRegistry`] is the single source of shared mutable state
//! in the core.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod client;
pub mod registry;

#[cfg(test)]
mod tests;

pub use client::{Connection, ConnectionSnapshot, ConnectionState, CounterSnapshot, IoCounters, UserRef};
pub use registry::{
    BindingKind, ClearedBinding, ConnectionRegistry, DispatchBind, Removal, RoleCounts, ViewerBind,
};

/// Type alias for connection identifiers.
///
/// Connection ids are assigned at accept time, start at 1 and are never
/// reused for the lifetime of the process. `0` means "no connection" in
/// binding fields.
pub type ConnectionId = u64;

/// Sentinel stored in binding fields when nothing is bound.
pub const NO_CONNECTION: ConnectionId = 0;

/// Identifier of an authenticated user account.
pub type UserId = u64;

/// What a connection does on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Connected but not logged in yet
    #[default]
    Unidentified,
    Pilot,
    Dispatcher,
    Atc,
    /// Spectator following a pilot
    Viewer,
}

impl Role {
    /// Whether clients in this role display other aircraft.
    pub fn renders_traffic(self) -> bool {
        matches!(self, Role::Pilot | Role::Viewer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Unidentified => "unidentified",
            Role::Pilot => "pilot",
            Role::Dispatcher => "dispatcher",
            Role::Atc => "atc",
            Role::Viewer => "viewer",
        };
        f.write_str(name)
    }
}

/// Frame compression negotiated at login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Deflate,
}
