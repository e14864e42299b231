//! Client connection representation.
//!
//! This module defines the structure of an individual client connection:
//! immutable identity, lock-protected session state and lock-free I/O
//! counters.

use super::{Compression, ConnectionId, Role, UserId, NO_CONNECTION};
use crate::geo::GeoPoint;
use crate::messaging::{FlightInfo, Position};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

/// The authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: UserId,
    pub callsign: String,
}

/// Mutable session state of a connection.
///
/// Fields are written by the router while handling the connection's own
/// messages. Binding fields of *other* connections are only ever changed
/// through the registry's bind/clear entry points.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Set once login completes
    pub user: Option<UserRef>,
    pub role: Role,
    pub on_duty: bool,
    pub busy: bool,
    pub hidden: bool,
    pub position: Option<Position>,
    pub flight_info: Option<FlightInfo>,
    pub last_activity: Instant,
    pub protocol_version: u32,
    pub compression: Compression,
    /// Dispatcher serving this pilot, [`NO_CONNECTION`] if none
    pub dispatcher_id: ConnectionId,
    /// User behind `dispatcher_id` at bind time, for re-resolution after a reconnect
    pub dispatcher_user: Option<UserId>,
    /// Pilot has an open service request no dispatcher has taken yet
    pub service_pending: bool,
    /// Spectator observing this pilot, [`NO_CONNECTION`] if none
    pub viewer_id: ConnectionId,
    /// Pilot this viewer follows, [`NO_CONNECTION`] if none
    pub viewing: ConnectionId,
    /// Initial traffic snapshot still owed; sent with the first position
    pub snapshot_pending: bool,
    /// Proximity radius for traffic, in nautical miles
    pub range_nm: f64,
    /// Cap on the initial traffic snapshot
    pub max_aircraft: usize,
    /// Dispatcher service radius, in nautical miles
    pub service_range_nm: f64,
    /// Dispatcher service center; falls back to the position
    pub service_center: Option<GeoPoint>,
}

impl ConnectionState {
    pub fn new(range_nm: f64, max_aircraft: usize, service_range_nm: f64) -> Self {
        Self {
            user: None,
            role: Role::Unidentified,
            on_duty: false,
            busy: false,
            hidden: false,
            position: None,
            flight_info: None,
            last_activity: Instant::now(),
            protocol_version: 0,
            compression: Compression::None,
            dispatcher_id: NO_CONNECTION,
            dispatcher_user: None,
            service_pending: false,
            viewer_id: NO_CONNECTION,
            viewing: NO_CONNECTION,
            snapshot_pending: false,
            range_nm,
            max_aircraft,
            service_range_nm,
            service_center: None,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user.as_ref().map(|u| u.user_id)
    }

    pub fn callsign(&self) -> &str {
        self.user.as_ref().map(|u| u.callsign.as_str()).unwrap_or("")
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn location(&self) -> Option<GeoPoint> {
        self.position.as_ref().map(|p| p.location)
    }

    /// Where a dispatcher's service range is measured from.
    pub fn service_location(&self) -> Option<GeoPoint> {
        self.service_center.or_else(|| self.location())
    }

    /// On duty, not busy and not hidden.
    pub fn is_available_dispatcher(&self) -> bool {
        self.role == Role::Dispatcher && self.on_duty && !self.busy && !self.hidden
    }

    pub fn is_on_duty_dispatcher(&self) -> bool {
        self.role == Role::Dispatcher && self.on_duty
    }
}

/// Byte and message counters, updated without locking.
#[derive(Debug, Default)]
pub struct IoCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

impl IoCounters {
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`IoCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

/// Represents an individual client connection to the server.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    connected_at: SystemTime,
    state: RwLock<ConnectionState>,
    counters: IoCounters,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Creates a connection in the unauthenticated state.
    pub fn new(id: ConnectionId, remote_addr: Option<SocketAddr>, state: ConnectionState) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: SystemTime::now(),
            state: RwLock::new(state),
            counters: IoCounters::default(),
            closed: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn counters(&self) -> &IoCounters {
        &self.counters
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves once the connection has been removed from the registry.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut receiver = self.closed.subscribe();
        async move {
            let _ = receiver.wait_for(|closed| *closed).await;
        }
    }

    /// Reads the session state under the connection's read lock.
    pub fn read<R>(&self, f: impl FnOnce(&ConnectionState) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutates the session state under the connection's write lock.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Records inbound activity for idle timeout purposes.
    pub fn touch(&self) {
        self.state.write().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.read().last_activity.elapsed()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            remote_addr: self.remote_addr,
            connected_at: self.connected_at,
            state: self.state.read().clone(),
            counters: self.counters.snapshot(),
        }
    }
}

/// Defensive copy of a connection handed out by registry queries.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: SystemTime,
    pub state: ConnectionState,
    pub counters: CounterSnapshot,
}

impl ConnectionSnapshot {
    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn callsign(&self) -> &str {
        self.state.callsign()
    }

    pub fn location(&self) -> Option<GeoPoint> {
        self.state.location()
    }

    pub fn distance_to(&self, point: &GeoPoint) -> Option<f64> {
        self.location().map(|l| l.distance_nm(point))
    }
}
