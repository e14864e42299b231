//! Message type definitions for client-server communication.
//!
//! Inbound traffic decodes into [`ClientMessage`], outbound traffic is built
//! as [`ServerMessage`]. Both are `type`-tagged so the reference JSON codec
//! produces frames such as:
//!
//! ```json
//! { "type": "service_accept", "pilot_id": 42 }
//! ```

use crate::connection::{Compression, ConnectionId, Role, UserId};
use crate::geo::GeoPoint;
use crate::store::SavedRoute;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Live aircraft state reported by a pilot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub location: GeoPoint,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub ground_speed_kts: f64,
    #[serde(default)]
    pub on_ground: bool,
}

/// Flight plan snapshot reported by a pilot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightInfo {
    pub flight_number: String,
    #[serde(default)]
    pub aircraft_type: String,
    #[serde(default)]
    pub departure: String,
    #[serde(default)]
    pub arrival: String,
}

/// A message sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session (re)initialization
    Login {
        user_id: UserId,
        callsign: String,
        token: String,
        role: Role,
        #[serde(default)]
        protocol_version: u32,
        #[serde(default)]
        compression: Compression,
        #[serde(default)]
        range_nm: Option<f64>,
        #[serde(default)]
        max_aircraft: Option<usize>,
    },
    Ping {
        #[serde(default)]
        nonce: u64,
    },
    Position(Position),
    FlightInfo(FlightInfo),
    /// Dispatcher duty state and service area
    DispatcherStatus {
        on_duty: bool,
        #[serde(default)]
        busy: bool,
        #[serde(default)]
        hidden: bool,
        #[serde(default)]
        range_nm: Option<f64>,
        #[serde(default)]
        center: Option<GeoPoint>,
    },
    /// Pilot asks for a dispatcher
    ServiceRequest {
        #[serde(default)]
        note: String,
    },
    /// Dispatcher takes a pilot's request
    ServiceAccept { pilot_id: ConnectionId },
    /// Either side ends the service; dispatchers name the pilot
    ServiceCancel {
        #[serde(default)]
        pilot_id: Option<ConnectionId>,
        #[serde(default)]
        reason: String,
    },
    /// Pilot reports the serviced flight as complete
    ServiceComplete {
        #[serde(default)]
        remarks: String,
    },
    /// Spectator asks to observe a pilot
    ViewerRequest { pilot_id: ConnectionId },
    /// Pilot accepts a spectator
    ViewerAccept { viewer_id: ConnectionId },
    /// Pilot declines a spectator
    ViewerReject { viewer_id: ConnectionId },
    /// Either side ends the viewing session; viewers name the pilot
    ViewerCancel {
        #[serde(default)]
        pilot_id: Option<ConnectionId>,
    },
    SaveRoute {
        name: String,
        waypoints: Vec<String>,
    },
    LoadRoutes,
}

impl ClientMessage {
    /// Short message kind used in activity strings and acknowledgements.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Login { .. } => "login",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Position(_) => "position",
            ClientMessage::FlightInfo(_) => "flight_info",
            ClientMessage::DispatcherStatus { .. } => "dispatcher_status",
            ClientMessage::ServiceRequest { .. } => "service_request",
            ClientMessage::ServiceAccept { .. } => "service_accept",
            ClientMessage::ServiceCancel { .. } => "service_cancel",
            ClientMessage::ServiceComplete { .. } => "service_complete",
            ClientMessage::ViewerRequest { .. } => "viewer_request",
            ClientMessage::ViewerAccept { .. } => "viewer_accept",
            ClientMessage::ViewerReject { .. } => "viewer_reject",
            ClientMessage::ViewerCancel { .. } => "viewer_cancel",
            ClientMessage::SaveRoute { .. } => "save_route",
            ClientMessage::LoadRoutes => "load_routes",
        }
    }
}

/// A message sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack {
        request: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Pong {
        nonce: u64,
        #[serde(default)]
        server_time_ms: u64,
    },
    Notice { text: String },
    /// Another aircraft's position
    Traffic {
        connection_id: ConnectionId,
        callsign: String,
        position: Position,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance_nm: Option<f64>,
        #[serde(default)]
        server_time_ms: u64,
    },
    TrafficRemoved { connection_id: ConnectionId },
    FlightInfo {
        connection_id: ConnectionId,
        callsign: String,
        info: FlightInfo,
    },
    /// A pilot's service request offered to a dispatcher
    ServiceOffer {
        pilot_id: ConnectionId,
        callsign: String,
        location: Option<GeoPoint>,
        distance_nm: f64,
        note: String,
    },
    ServiceBound {
        pilot_id: ConnectionId,
        dispatcher_id: ConnectionId,
        dispatcher_callsign: String,
    },
    ServiceCancelled {
        pilot_id: ConnectionId,
        reason: String,
    },
    ServiceCompleted {
        pilot_id: ConnectionId,
        remarks: String,
    },
    ViewerRequested {
        viewer_id: ConnectionId,
        callsign: String,
    },
    ViewerBound {
        pilot_id: ConnectionId,
        viewer_id: ConnectionId,
    },
    ViewerRejected {
        pilot_id: ConnectionId,
        reason: String,
    },
    ViewerCancelled {
        pilot_id: ConnectionId,
        viewer_id: ConnectionId,
    },
    Routes { routes: Vec<SavedRoute> },
}

impl ServerMessage {
    pub fn ack(request: impl Into<String>) -> Self {
        ServerMessage::Ack {
            request: request.into(),
            ok: true,
            error: None,
        }
    }

    pub fn nack(request: impl Into<String>, error: impl Into<String>) -> Self {
        ServerMessage::Ack {
            request: request.into(),
            ok: false,
            error: Some(error.into()),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        ServerMessage::Notice { text: text.into() }
    }
}

/// A decoded inbound message with its origin.
///
/// Created by the decode stage and consumed by the router; never mutated.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: ClientMessage,
    pub sender: ConnectionId,
    /// The authenticated user behind the sender, if login has completed
    pub owner: Option<UserId>,
    pub received_at: Instant,
}

impl Envelope {
    pub fn new(message: ClientMessage, sender: ConnectionId, owner: Option<UserId>) -> Self {
        Self {
            message,
            sender,
            owner,
            received_at: Instant::now(),
        }
    }
}

/// A message the router wants delivered to one connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: ConnectionId,
    pub message: ServerMessage,
    /// Skip write batching and flush as soon as it reaches the write stage
    pub immediate: bool,
}
