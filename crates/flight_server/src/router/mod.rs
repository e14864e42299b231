//! Message routing: one handler per client message type.
//!
//! The [`Router`] is the command layer of the core. It runs synchronously on
//! the logic pool's threads, reads and mutates the
//! [`ConnectionRegistry`](crate::connection::ConnectionRegistry) and hands
//! outbound messages to its [`Outbox`].
//!
//! Two stateful protocols live here besides plain relaying:
//!
//! - **Dispatch service**: a pilot's request is offered to every available
//!   dispatcher in range; the first accept binds the pair, either side may
//!   cancel, and the pilot completes the service.
//! - **Flight viewing**: a spectator asks to follow a pilot; the pilot
//!   accepts or rejects, and from then on the pilot's position goes only to
//!   that spectator.
//!
//! Cross-connection changes always go through the registry's bind/clear
//! entry points, never through a direct write to another connection.

use crate::auth::Authenticator;
use crate::config::RouterConfig;
use crate::connection::{
    BindingKind, ConnectionId, ConnectionRegistry, ConnectionSnapshot, Removal, Role, NO_CONNECTION,
};
use crate::error::RouteError;
use crate::messaging::{ClientMessage, Envelope, Outbound, ServerMessage};
use crate::pool;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

mod dispatch;
pub mod outbox;
mod routes;
mod session;
mod viewer;

#[cfg(test)]
mod tests;

pub use outbox::Outbox;

/// Router counters for metrics export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub handled: u64,
    pub rejected: u64,
    pub stale_senders: u64,
    pub delivered: u64,
    pub routing_misses: u64,
    pub dispatch_bindings: u64,
    pub viewer_bindings: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Default)]
struct RouterCounters {
    handled: AtomicU64,
    rejected: AtomicU64,
    stale_senders: AtomicU64,
    dispatch_bindings: AtomicU64,
    viewer_bindings: AtomicU64,
    persistence_failures: AtomicU64,
}

/// Per-message-type handlers over the shared connection state.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    outbox: Outbox,
    store: Arc<dyn Store>,
    auth: Arc<dyn Authenticator>,
    config: RouterConfig,
    counters: RouterCounters,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        outbound: mpsc::UnboundedSender<Outbound>,
        store: Arc<dyn Store>,
        auth: Arc<dyn Authenticator>,
        config: RouterConfig,
    ) -> Self {
        Self {
            outbox: Outbox::new(registry.clone(), outbound),
            registry,
            store,
            auth,
            config,
            counters: RouterCounters::default(),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handles one decoded message.
    ///
    /// Failures never propagate: they are answered with a negative
    /// acknowledgement to the sender.
    pub fn handle(&self, envelope: &Envelope) {
        let kind = envelope.message.kind();
        if let Some(status) = pool::current_status() {
            status.set_activity(format!("{} from {}", kind, envelope.sender));
        }

        let Some(me) = self.registry.snapshot(envelope.sender) else {
            self.counters.stale_senders.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping {} from departed connection {}", kind, envelope.sender);
            return;
        };

        self.counters.handled.fetch_add(1, Ordering::Relaxed);
        trace!("📨 {} from connection {} ({})", kind, me.id, me.role());

        if let Err(e) = self.dispatch_message(envelope, &me) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            if matches!(e, RouteError::Store(_)) {
                self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
            }
            debug!("🚫 Rejected {} from {}: {}", kind, envelope.sender, e);
            self.outbox.push(envelope, ServerMessage::nack(kind, e.to_string()));
        }
    }

    fn dispatch_message(&self, envelope: &Envelope, me: &ConnectionSnapshot) -> Result<(), RouteError> {
        match &envelope.message {
            ClientMessage::Login {
                user_id,
                callsign,
                token,
                role,
                protocol_version,
                compression,
                range_nm,
                max_aircraft,
            } => self.login(
                envelope,
                me,
                session::LoginRequest {
                    user_id: *user_id,
                    callsign,
                    token,
                    role: *role,
                    protocol_version: *protocol_version,
                    compression: *compression,
                    range_nm: *range_nm,
                    max_aircraft: *max_aircraft,
                },
            ),
            ClientMessage::Ping { nonce } => {
                self.ping(envelope, *nonce);
                Ok(())
            }
            message => {
                if !me.state.is_authenticated() {
                    return Err(RouteError::NotLoggedIn);
                }
                self.dispatch_authenticated(envelope, me, message)
            }
        }
    }

    fn dispatch_authenticated(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        message: &ClientMessage,
    ) -> Result<(), RouteError> {
        match message {
            ClientMessage::Position(position) => self.position(me, position),
            ClientMessage::FlightInfo(info) => self.flight_info(me, info),
            ClientMessage::DispatcherStatus {
                on_duty,
                busy,
                hidden,
                range_nm,
                center,
            } => self.dispatcher_status(
                envelope,
                me,
                session::DutyUpdate {
                    on_duty: *on_duty,
                    busy: *busy,
                    hidden: *hidden,
                    range_nm: *range_nm,
                    center: *center,
                },
            ),
            ClientMessage::ServiceRequest { note } => self.service_request(envelope, me, note),
            ClientMessage::ServiceAccept { pilot_id } => self.service_accept(envelope, me, *pilot_id),
            ClientMessage::ServiceCancel { pilot_id, reason } => {
                self.service_cancel(envelope, me, *pilot_id, reason)
            }
            ClientMessage::ServiceComplete { remarks } => self.service_complete(envelope, me, remarks),
            ClientMessage::ViewerRequest { pilot_id } => self.viewer_request(envelope, me, *pilot_id),
            ClientMessage::ViewerAccept { viewer_id } => self.viewer_accept(envelope, me, *viewer_id),
            ClientMessage::ViewerReject { viewer_id } => self.viewer_reject(envelope, me, *viewer_id),
            ClientMessage::ViewerCancel { pilot_id } => self.viewer_cancel(envelope, me, *pilot_id),
            ClientMessage::SaveRoute { name, waypoints } => {
                self.save_route(envelope, me, name, waypoints)
            }
            ClientMessage::LoadRoutes => self.load_routes(envelope, me),
            ClientMessage::Login { .. } | ClientMessage::Ping { .. } => Ok(()),
        }
    }

    /// Notifies everyone affected by a connection's removal.
    ///
    /// Called by the logic stage after
    /// [`ConnectionRegistry::remove`](crate::connection::ConnectionRegistry::remove).
    pub fn on_disconnect(&self, removal: &Removal) {
        let gone = &removal.snapshot;
        let state = &gone.state;
        info!(
            "👋 Connection {} ({} {}) disconnected",
            gone.id,
            state.role,
            gone.callsign()
        );

        for cleared in &removal.cleared {
            let message = match cleared.kind {
                BindingKind::Dispatcher => ServerMessage::ServiceCancelled {
                    pilot_id: cleared.connection_id,
                    reason: String::from("dispatcher disconnected"),
                },
                BindingKind::Viewer => ServerMessage::ViewerCancelled {
                    pilot_id: cleared.connection_id,
                    viewer_id: gone.id,
                },
            };
            self.outbox.push_to(message, cleared.connection_id);
        }

        if state.role != Role::Pilot {
            return;
        }

        if state.dispatcher_id != NO_CONNECTION || state.service_pending {
            let cancel = ServerMessage::ServiceCancelled {
                pilot_id: gone.id,
                reason: String::from("pilot disconnected"),
            };
            let relayed = state.dispatcher_id != NO_CONNECTION
                && self.outbox.push_dispatch_to(cancel.clone(), state.dispatcher_id);
            if !relayed {
                self.outbox.push_dispatch(cancel);
            }
        }

        if state.viewer_id != NO_CONNECTION {
            self.outbox.push_to(
                ServerMessage::ViewerCancelled {
                    pilot_id: gone.id,
                    viewer_id: state.viewer_id,
                },
                state.viewer_id,
            );
        } else if let Some(location) = state.location() {
            let watchers = self.registry.within(&location, state.range_nm, |c| {
                c.role().renders_traffic() && c.id != gone.id
            });
            for (watcher, _) in watchers {
                self.outbox
                    .push_to(ServerMessage::TrafficRemoved { connection_id: gone.id }, watcher.id);
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            handled: self.counters.handled.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            stale_senders: self.counters.stale_senders.load(Ordering::Relaxed),
            delivered: self.outbox.delivered(),
            routing_misses: self.outbox.misses(),
            dispatch_bindings: self.counters.dispatch_bindings.load(Ordering::Relaxed),
            viewer_bindings: self.counters.viewer_bindings.load(Ordering::Relaxed),
            persistence_failures: self.counters.persistence_failures.load(Ordering::Relaxed),
        }
    }

    fn require_role(me: &ConnectionSnapshot, role: Role) -> Result<(), RouteError> {
        if me.role() == role {
            Ok(())
        } else {
            Err(RouteError::WrongRole(me.role()))
        }
    }

    /// Live snapshot of `id` if it is logged in with `role`.
    fn counterpart(&self, id: ConnectionId, role: Role) -> Result<ConnectionSnapshot, RouteError> {
        self.registry
            .snapshot(id)
            .filter(|c| c.role() == role)
            .ok_or(RouteError::Unavailable(id))
    }
}
