//! Session handlers: login, keep-alive, telemetry and duty status.

use super::Router;
use crate::connection::{Compression, ConnectionId, ConnectionSnapshot, Role, UserId, UserRef, NO_CONNECTION};
use crate::error::RouteError;
use crate::geo::GeoPoint;
use crate::messaging::{Envelope, FlightInfo, Position, ServerMessage};
use crate::utils::current_timestamp_ms;
use tracing::{debug, info};

pub(super) struct LoginRequest<'a> {
    pub user_id: UserId,
    pub callsign: &'a str,
    pub token: &'a str,
    pub role: Role,
    pub protocol_version: u32,
    pub compression: Compression,
    pub range_nm: Option<f64>,
    pub max_aircraft: Option<usize>,
}

pub(super) struct DutyUpdate {
    pub on_duty: bool,
    pub busy: bool,
    pub hidden: bool,
    pub range_nm: Option<f64>,
    pub center: Option<GeoPoint>,
}

fn valid_range(range_nm: Option<f64>) -> Result<(), RouteError> {
    match range_nm {
        Some(r) if !(r.is_finite() && r > 0.0) => {
            Err(RouteError::Rejected(format!("invalid range {r}")))
        }
        _ => Ok(()),
    }
}

/// Traffic update describing `pilot`, if it has reported a position.
pub(super) fn traffic_for(pilot: &ConnectionSnapshot) -> Option<ServerMessage> {
    let position = pilot.state.position.clone()?;
    Some(ServerMessage::Traffic {
        connection_id: pilot.id,
        callsign: pilot.callsign().to_string(),
        position,
        distance_nm: None,
        server_time_ms: 0,
    })
}

impl Router {
    /// Session (re)initialization.
    pub(super) fn login(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        request: LoginRequest<'_>,
    ) -> Result<(), RouteError> {
        if request.role == Role::Unidentified {
            return Err(RouteError::Rejected(String::from("a role is required")));
        }
        let callsign = request.callsign.trim();
        if callsign.is_empty() {
            return Err(RouteError::Rejected(String::from("a callsign is required")));
        }
        valid_range(request.range_nm)?;
        if me.state.is_authenticated() && me.role() != request.role {
            return Err(RouteError::Rejected(String::from(
                "role cannot change within a session",
            )));
        }

        let profile = self.auth.authenticate(request.user_id, request.token)?;
        if !profile.permits(request.role) {
            return Err(RouteError::WrongRole(request.role));
        }

        let range_nm = request.range_nm.unwrap_or(self.config.default_range_nm);
        let max_aircraft = request.max_aircraft.unwrap_or(self.config.default_max_aircraft);
        let has_position = self.registry.update(me.id, |state| {
            state.user = Some(UserRef {
                user_id: profile.user_id,
                callsign: callsign.to_string(),
            });
            state.role = request.role;
            state.protocol_version = request.protocol_version;
            state.compression = request.compression;
            state.range_nm = range_nm;
            state.max_aircraft = max_aircraft;
            state.snapshot_pending = request.role.renders_traffic();
            state.location().is_some()
        })?;

        info!(
            "🔐 Connection {} logged in as {} {} (user {}, protocol v{})",
            me.id, request.role, callsign, profile.user_id, request.protocol_version
        );
        self.outbox.push_immediate(ServerMessage::ack("login"), envelope.sender);

        if has_position && request.role.renders_traffic() {
            self.send_snapshot(me.id);
        }
        Ok(())
    }

    pub(super) fn ping(&self, envelope: &Envelope, nonce: u64) {
        self.outbox.push_immediate(
            ServerMessage::Pong {
                nonce,
                server_time_ms: current_timestamp_ms(),
            },
            envelope.sender,
        );
    }

    /// Initial traffic picture: nearest pilots first, capped at the
    /// connection's aircraft limit.
    pub(super) fn send_snapshot(&self, id: ConnectionId) {
        let Some(me) = self.registry.snapshot(id) else {
            return;
        };
        let Some(location) = me.location() else {
            return;
        };

        let nearby = self.registry.within(&location, me.state.range_nm, |c| {
            c.id != id && c.role() == Role::Pilot && c.state.viewer_id == NO_CONNECTION
        });
        let available = nearby.len();
        let mut sent = 0;
        for (pilot, _) in nearby.into_iter().take(me.state.max_aircraft) {
            if let Some(traffic) = traffic_for(&pilot) {
                if self.outbox.push_to(traffic, id) {
                    sent += 1;
                }
            }
        }
        let _ = self.registry.update(id, |s| s.snapshot_pending = false);
        debug!(
            "🛰️ Sent {} of {} nearby aircraft to connection {}",
            sent, available, id
        );
    }

    pub(super) fn position(&self, me: &ConnectionSnapshot, position: &Position) -> Result<(), RouteError> {
        if !position.location.is_valid() {
            return Err(RouteError::Rejected(String::from("invalid coordinates")));
        }

        let (snapshot_owed, dispatcher_id, viewer_id) = self.registry.update(me.id, |state| {
            state.position = Some(position.clone());
            (state.snapshot_pending, state.dispatcher_id, state.viewer_id)
        })?;

        if snapshot_owed {
            self.send_snapshot(me.id);
        }
        if me.role() != Role::Pilot {
            return Ok(());
        }

        let traffic = ServerMessage::Traffic {
            connection_id: me.id,
            callsign: me.callsign().to_string(),
            position: position.clone(),
            distance_nm: None,
            server_time_ms: 0,
        };

        // A bound viewer is the sole recipient, serving dispatcher included.
        if viewer_id != NO_CONNECTION {
            self.outbox.push_to(traffic, viewer_id);
            return Ok(());
        }

        if dispatcher_id != NO_CONNECTION {
            self.outbox.push_dispatch_to(traffic.clone(), dispatcher_id);
        }

        let recipients = self.registry.within(&position.location, me.state.range_nm, |c| {
            c.id != me.id && c.role().renders_traffic()
        });
        for (recipient, _) in recipients {
            self.outbox.push_to(traffic.clone(), recipient.id);
        }
        Ok(())
    }

    pub(super) fn flight_info(&self, me: &ConnectionSnapshot, info: &FlightInfo) -> Result<(), RouteError> {
        Self::require_role(me, Role::Pilot)?;
        let (dispatcher_id, viewer_id) = self.registry.update(me.id, |state| {
            state.flight_info = Some(info.clone());
            (state.dispatcher_id, state.viewer_id)
        })?;

        let relay = ServerMessage::FlightInfo {
            connection_id: me.id,
            callsign: me.callsign().to_string(),
            info: info.clone(),
        };
        if dispatcher_id != NO_CONNECTION {
            self.outbox.push_dispatch_to(relay.clone(), dispatcher_id);
        }
        if viewer_id != NO_CONNECTION {
            self.outbox.push_to(relay, viewer_id);
        }
        Ok(())
    }

    pub(super) fn dispatcher_status(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        update: DutyUpdate,
    ) -> Result<(), RouteError> {
        Self::require_role(me, Role::Dispatcher)?;
        valid_range(update.range_nm)?;
        if let Some(center) = update.center {
            if !center.is_valid() {
                return Err(RouteError::Rejected(String::from("invalid service center")));
            }
        }

        self.registry.update(me.id, |state| {
            state.on_duty = update.on_duty;
            state.busy = update.busy;
            state.hidden = update.hidden;
            if let Some(range) = update.range_nm {
                state.service_range_nm = range;
            }
            if update.center.is_some() {
                state.service_center = update.center;
            }
        })?;

        info!(
            "📋 Dispatcher {} is {}{}{}",
            me.callsign(),
            if update.on_duty { "on duty" } else { "off duty" },
            if update.busy { ", busy" } else { "" },
            if update.hidden { ", hidden" } else { "" }
        );
        self.outbox.push(envelope, ServerMessage::ack("dispatcher_status"));
        Ok(())
    }
}
