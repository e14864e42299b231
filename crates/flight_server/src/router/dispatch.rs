//! Dispatch service binding between pilots and dispatchers.
//!
//! `unbound → offered → bound → unbound`. The pilot's request fans out to
//! every available dispatcher whose service range covers the pilot; the
//! registry's compare-and-swap bind decides which accept wins.

use super::Router;
use crate::connection::{ConnectionId, ConnectionSnapshot, DispatchBind, Role, UserId, NO_CONNECTION};
use crate::error::RouteError;
use crate::messaging::{Envelope, ServerMessage};
use crate::store::{DispatchOutcome, DispatchRecord};
use crate::utils::current_timestamp_ms;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl Router {
    pub(super) fn service_request(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        note: &str,
    ) -> Result<(), RouteError> {
        Self::require_role(me, Role::Pilot)?;
        let Some(location) = me.location() else {
            return Err(RouteError::Rejected(String::from(
                "report a position before requesting service",
            )));
        };
        if me.state.dispatcher_id != NO_CONNECTION {
            return Err(RouteError::Rejected(String::from("already being serviced")));
        }

        let mut offered = 0;
        let mut out_of_range = 0;
        for dispatcher in self.registry.get_all(|c| c.state.is_available_dispatcher()) {
            let distance = dispatcher
                .state
                .service_location()
                .map(|center| location.distance_nm(&center));
            match distance {
                Some(d) if d <= dispatcher.state.service_range_nm => {
                    let offer = ServerMessage::ServiceOffer {
                        pilot_id: me.id,
                        callsign: me.callsign().to_string(),
                        location: Some(location),
                        distance_nm: d,
                        note: note.to_string(),
                    };
                    if self.outbox.push_dispatch_to(offer, dispatcher.id) {
                        offered += 1;
                    }
                }
                _ => out_of_range += 1,
            }
        }

        self.registry.update(me.id, |s| s.service_pending = offered > 0)?;
        info!(
            "🆘 Service request from {} offered to {} dispatcher(s), {} out of range",
            me.callsign(),
            offered,
            out_of_range
        );

        self.outbox.push(envelope, ServerMessage::ack("service_request"));
        if out_of_range > 0 {
            self.outbox.push(
                envelope,
                ServerMessage::notice(format!("{out_of_range} dispatchers out of range")),
            );
        }
        if offered == 0 {
            self.outbox
                .push(envelope, ServerMessage::notice("No dispatcher is available right now"));
        }
        Ok(())
    }

    pub(super) fn service_accept(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        pilot_id: ConnectionId,
    ) -> Result<(), RouteError> {
        Self::require_role(me, Role::Dispatcher)?;
        if !me.state.is_available_dispatcher() {
            return Err(RouteError::Rejected(String::from(
                "go on duty and available before accepting service",
            )));
        }
        self.counterpart(pilot_id, Role::Pilot)?;

        match self.registry.bind_dispatcher(pilot_id, me.id)? {
            DispatchBind::Bound => {
                self.counters.dispatch_bindings.fetch_add(1, Ordering::Relaxed);
                info!("🤝 Dispatcher {} now serves pilot {}", me.callsign(), pilot_id);
                self.outbox.push(envelope, ServerMessage::ack("service_accept"));
                self.outbox.push_to(
                    ServerMessage::ServiceBound {
                        pilot_id,
                        dispatcher_id: me.id,
                        dispatcher_callsign: me.callsign().to_string(),
                    },
                    pilot_id,
                );
                Ok(())
            }
            DispatchBind::AlreadyBound => {
                debug!("Dispatcher {} re-accepted pilot {}", me.id, pilot_id);
                self.outbox.push(envelope, ServerMessage::ack("service_accept"));
                Ok(())
            }
            DispatchBind::Taken(owner) => {
                info!(
                    "Pilot {} is already served by {}; ignoring accept from {}",
                    pilot_id, owner, me.id
                );
                self.outbox.push_dispatch_except(
                    ServerMessage::ServiceCancelled {
                        pilot_id,
                        reason: String::from("taken by another dispatcher"),
                    },
                    Some(owner),
                );
                Err(RouteError::Rejected(String::from(
                    "another dispatcher already took this pilot",
                )))
            }
            DispatchBind::NotRequested => {
                debug!("Dispatcher {} accepted pilot {} without an open request", me.id, pilot_id);
                Err(RouteError::Rejected(format!("pilot {pilot_id} has not requested service")))
            }
        }
    }

    pub(super) fn service_cancel(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        pilot_id: Option<ConnectionId>,
        reason: &str,
    ) -> Result<(), RouteError> {
        match me.role() {
            Role::Pilot => self.cancel_from_pilot(envelope, me, reason),
            Role::Dispatcher => {
                let pilot_id = pilot_id
                    .ok_or_else(|| RouteError::Rejected(String::from("pilot_id is required")))?;
                self.cancel_from_dispatcher(envelope, me, pilot_id, reason)
            }
            other => Err(RouteError::WrongRole(other)),
        }
    }

    fn cancel_from_pilot(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        reason: &str,
    ) -> Result<(), RouteError> {
        let cancel = ServerMessage::ServiceCancelled {
            pilot_id: me.id,
            reason: reason.to_string(),
        };
        self.registry.update(me.id, |s| s.service_pending = false)?;

        let relayed = match self.registry.clear_dispatcher(me.id, None) {
            Some((dispatcher_id, dispatcher_user)) => {
                self.record_dispatch(me, dispatcher_user, DispatchOutcome::Cancelled, reason);
                self.outbox.push_dispatch_to(cancel.clone(), dispatcher_id)
            }
            None => false,
        };
        if !relayed {
            // No live counterpart: withdraw any open offer everywhere.
            let reached = self.outbox.push_dispatch(cancel);
            debug!("Service cancel from {} broadcast to {} dispatcher(s)", me.id, reached);
        }

        info!("❎ Pilot {} cancelled service: {}", me.callsign(), reason);
        self.outbox.push(envelope, ServerMessage::ack("service_cancel"));
        Ok(())
    }

    fn cancel_from_dispatcher(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        pilot_id: ConnectionId,
        reason: &str,
    ) -> Result<(), RouteError> {
        if self.registry.clear_dispatcher(pilot_id, Some(me.id)).is_none() {
            return Err(RouteError::Rejected(format!("not serving pilot {pilot_id}")));
        }

        if let Some(pilot) = self.registry.snapshot(pilot_id) {
            self.record_dispatch(&pilot, me.state.user_id(), DispatchOutcome::Cancelled, reason);
        }
        self.outbox.push_to(
            ServerMessage::ServiceCancelled {
                pilot_id,
                reason: reason.to_string(),
            },
            pilot_id,
        );
        info!("❎ Dispatcher {} released pilot {}: {}", me.callsign(), pilot_id, reason);
        self.outbox.push(envelope, ServerMessage::ack("service_cancel"));
        Ok(())
    }

    pub(super) fn service_complete(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        remarks: &str,
    ) -> Result<(), RouteError> {
        Self::require_role(me, Role::Pilot)?;
        let bound_id = me.state.dispatcher_id;
        if bound_id == NO_CONNECTION {
            return Err(RouteError::Rejected(String::from("no active service")));
        }
        let dispatcher_user = me.state.dispatcher_user;

        let mut tx = self.store.begin()?;
        let record = DispatchRecord {
            pilot_user: me.state.user_id(),
            dispatcher_user,
            outcome: DispatchOutcome::Completed,
            remarks: remarks.to_string(),
            recorded_at_ms: current_timestamp_ms(),
        };
        if let Err(e) = tx.record_dispatch(record) {
            tx.rollback();
            return Err(e.into());
        }
        tx.commit()?;

        if self.registry.clear_dispatcher(me.id, Some(bound_id)).is_none() {
            debug!("Dispatcher binding of {} was already cleared", me.id);
        }

        // Re-resolve by user so a dispatcher who reconnected still hears about it.
        let resolved = dispatcher_user
            .and_then(|user| self.registry.get_by_user(user, Some(Role::Dispatcher)))
            .map(|c| c.id);
        let completed = ServerMessage::ServiceCompleted {
            pilot_id: me.id,
            remarks: remarks.to_string(),
        };
        match resolved {
            Some(target) => {
                if target != bound_id {
                    warn!(
                        "⚠️ Service completion for pilot {}: bound dispatcher was {} but user resolves to {}",
                        me.id, bound_id, target
                    );
                }
                self.outbox.push_dispatch_to(completed, target);
            }
            None => warn!(
                "⚠️ Service completion for pilot {}: dispatcher {} is no longer online",
                me.id, bound_id
            ),
        }

        info!("✅ Pilot {} completed service", me.callsign());
        self.outbox.push(envelope, ServerMessage::ack("service_complete"));
        Ok(())
    }

    /// Best-effort audit of a cancelled service; failures only log.
    fn record_dispatch(
        &self,
        pilot: &ConnectionSnapshot,
        dispatcher_user: Option<UserId>,
        outcome: DispatchOutcome,
        remarks: &str,
    ) {
        let record = DispatchRecord {
            pilot_user: pilot.state.user_id(),
            dispatcher_user,
            outcome,
            remarks: remarks.to_string(),
            recorded_at_ms: current_timestamp_ms(),
        };
        let result = self.store.begin().and_then(|mut tx| match tx.record_dispatch(record) {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        });
        if let Err(e) = result {
            self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️ Failed to record dispatch outcome for pilot {}: {}", pilot.id, e);
        }
    }
}
