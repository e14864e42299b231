//! Flight-viewer binding between a spectator and a pilot.

use super::session::traffic_for;
use super::Router;
use crate::connection::{ConnectionId, ConnectionSnapshot, Role, ViewerBind, NO_CONNECTION};
use crate::error::RouteError;
use crate::messaging::{Envelope, ServerMessage};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

const ALREADY_VIEWED: &str = "pilot already has a viewer";
const ALREADY_FOLLOWING: &str = "viewer already follows another pilot";

impl Router {
    pub(super) fn viewer_request(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        pilot_id: ConnectionId,
    ) -> Result<(), RouteError> {
        Self::require_role(me, Role::Viewer)?;
        let pilot = self.counterpart(pilot_id, Role::Pilot)?;
        let following = me.state.viewing;
        if following != NO_CONNECTION && following != pilot_id {
            debug!(
                "Viewer {} asked for pilot {} while following {}",
                me.id, pilot_id, following
            );
            self.outbox.push(
                envelope,
                ServerMessage::ViewerRejected {
                    pilot_id,
                    reason: String::from(ALREADY_FOLLOWING),
                },
            );
            return Err(RouteError::Rejected(String::from(ALREADY_FOLLOWING)));
        }

        match pilot.state.viewer_id {
            NO_CONNECTION => {
                self.outbox.push_to(
                    ServerMessage::ViewerRequested {
                        viewer_id: me.id,
                        callsign: me.callsign().to_string(),
                    },
                    pilot_id,
                );
                debug!("👁️ Viewer {} asked to follow pilot {}", me.id, pilot_id);
                self.outbox.push(envelope, ServerMessage::ack("viewer_request"));
                Ok(())
            }
            current if current == me.id => {
                self.outbox.push(envelope, ServerMessage::ack("viewer_request"));
                Ok(())
            }
            _ => {
                self.outbox.push(
                    envelope,
                    ServerMessage::ViewerRejected {
                        pilot_id,
                        reason: String::from(ALREADY_VIEWED),
                    },
                );
                Err(RouteError::Rejected(String::from(ALREADY_VIEWED)))
            }
        }
    }

    pub(super) fn viewer_accept(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        viewer_id: ConnectionId,
    ) -> Result<(), RouteError> {
        Self::require_role(me, Role::Pilot)?;
        self.counterpart(viewer_id, Role::Viewer)?;

        match self.registry.bind_viewer(me.id, viewer_id)? {
            ViewerBind::Bound => {
                self.counters.viewer_bindings.fetch_add(1, Ordering::Relaxed);
                info!("👁️ Viewer {} now follows pilot {}", viewer_id, me.callsign());
                self.outbox.push_to(
                    ServerMessage::ViewerBound {
                        pilot_id: me.id,
                        viewer_id,
                    },
                    viewer_id,
                );
                if let Some(traffic) = traffic_for(me) {
                    self.outbox.push_to(traffic, viewer_id);
                }
                self.outbox.push(envelope, ServerMessage::ack("viewer_accept"));
                Ok(())
            }
            ViewerBind::AlreadyBound => {
                self.outbox.push(envelope, ServerMessage::ack("viewer_accept"));
                Ok(())
            }
            ViewerBind::Rejected(current) => {
                debug!(
                    "Pilot {} already viewed by {}; rejecting {}",
                    me.id, current, viewer_id
                );
                self.outbox.push_to(
                    ServerMessage::ViewerRejected {
                        pilot_id: me.id,
                        reason: String::from(ALREADY_VIEWED),
                    },
                    viewer_id,
                );
                Err(RouteError::Rejected(String::from(ALREADY_VIEWED)))
            }
            ViewerBind::Following(other) => {
                debug!(
                    "Viewer {} already follows pilot {}; pilot {} cannot take it",
                    viewer_id, other, me.id
                );
                self.outbox.push_to(
                    ServerMessage::ViewerRejected {
                        pilot_id: me.id,
                        reason: String::from(ALREADY_FOLLOWING),
                    },
                    viewer_id,
                );
                Err(RouteError::Rejected(String::from(ALREADY_FOLLOWING)))
            }
        }
    }

    pub(super) fn viewer_reject(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        viewer_id: ConnectionId,
    ) -> Result<(), RouteError> {
        Self::require_role(me, Role::Pilot)?;
        if self.registry.clear_viewer(me.id, Some(viewer_id)).is_some() {
            debug!("Pilot {} dropped bound viewer {}", me.id, viewer_id);
        }
        self.outbox.push_to(
            ServerMessage::ViewerRejected {
                pilot_id: me.id,
                reason: String::from("declined by pilot"),
            },
            viewer_id,
        );
        self.outbox.push(envelope, ServerMessage::ack("viewer_reject"));
        Ok(())
    }

    pub(super) fn viewer_cancel(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        pilot_id: Option<ConnectionId>,
    ) -> Result<(), RouteError> {
        match me.role() {
            Role::Viewer => {
                let pilot_id = pilot_id
                    .ok_or_else(|| RouteError::Rejected(String::from("pilot_id is required")))?;
                // Only clears if the pilot still points at this viewer.
                if self.registry.clear_viewer(pilot_id, Some(me.id)).is_some() {
                    self.outbox.push_to(
                        ServerMessage::ViewerCancelled {
                            pilot_id,
                            viewer_id: me.id,
                        },
                        pilot_id,
                    );
                    info!("👁️ Viewer {} stopped following pilot {}", me.id, pilot_id);
                }
            }
            Role::Pilot => {
                if let Some(viewer_id) = self.registry.clear_viewer(me.id, None) {
                    self.outbox.push_to(
                        ServerMessage::ViewerCancelled {
                            pilot_id: me.id,
                            viewer_id,
                        },
                        viewer_id,
                    );
                    info!("👁️ Pilot {} ended viewing by {}", me.callsign(), viewer_id);
                }
            }
            other => return Err(RouteError::WrongRole(other)),
        }
        self.outbox.push(envelope, ServerMessage::ack("viewer_cancel"));
        Ok(())
    }
}
