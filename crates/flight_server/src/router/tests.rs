use super::*;
use crate::auth::TrustingAuthenticator;
use crate::connection::{Compression, Connection, ConnectionState, UserId};
use crate::geo::GeoPoint;
use crate::messaging::Position;
use crate::store::{DispatchOutcome, MemoryStore};
use std::sync::Barrier;
use std::thread;

struct Fixture {
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    store: Arc<MemoryStore>,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Fixture {
    fn new() -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new(
            registry.clone(),
            tx,
            store.clone(),
            Arc::new(TrustingAuthenticator),
            RouterConfig::default(),
        );
        Self {
            registry,
            router: Arc::new(router),
            store,
            rx,
        }
    }

    fn connect(&self) -> ConnectionId {
        let id = self.registry.allocate_id();
        self.registry
            .add(Connection::new(id, None, ConnectionState::new(40.0, 100, 500.0)))
            .expect("register");
        id
    }

    fn send(&self, from: ConnectionId, message: ClientMessage) {
        self.router.handle(&Envelope::new(message, from, None));
    }

    fn login_with(&mut self, role: Role, user: UserId, range_nm: Option<f64>, max_aircraft: Option<usize>) -> ConnectionId {
        let id = self.connect();
        self.send(
            id,
            ClientMessage::Login {
                user_id: user,
                callsign: format!("{role}{user}"),
                token: String::from("token"),
                role,
                protocol_version: 2,
                compression: Compression::None,
                range_nm,
                max_aircraft,
            },
        );
        self.drain();
        id
    }

    fn login(&mut self, role: Role, user: UserId) -> ConnectionId {
        self.login_with(role, user, None, None)
    }

    fn move_to(&mut self, id: ConnectionId, lat: f64, lon: f64) {
        self.send(
            id,
            ClientMessage::Position(Position {
                location: GeoPoint::new(lat, lon),
                heading: 90.0,
                ground_speed_kts: 250.0,
                on_ground: false,
            }),
        );
    }

    fn on_duty(&mut self, id: ConnectionId, range_nm: f64, center: GeoPoint) {
        self.send(
            id,
            ClientMessage::DispatcherStatus {
                on_duty: true,
                busy: false,
                hidden: false,
                range_nm: Some(range_nm),
                center: Some(center),
            },
        );
        self.drain();
    }

    fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(outbound) = self.rx.try_recv() {
            out.push(outbound);
        }
        out
    }
}

fn to(out: &[Outbound], target: ConnectionId) -> Vec<ServerMessage> {
    out.iter()
        .filter(|o| o.target == target)
        .map(|o| o.message.clone())
        .collect()
}

fn is_traffic_from(message: &ServerMessage, from: ConnectionId) -> bool {
    matches!(message, ServerMessage::Traffic { connection_id, .. } if *connection_id == from)
}

fn is_nack(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::Ack { ok: false, .. })
}

#[test]
fn test_messages_before_login_are_refused() {
    let mut fx = Fixture::new();
    let id = fx.connect();
    fx.move_to(id, 50.0, 8.0);
    let out = fx.drain();
    let replies = to(&out, id);
    assert_eq!(replies.len(), 1);
    assert!(matches!(&replies[0], ServerMessage::Ack { request, ok: false, .. } if request == "position"));
    assert_eq!(fx.router.stats().rejected, 1);
}

#[test]
fn test_login_and_ping_are_immediate() {
    let mut fx = Fixture::new();
    let id = fx.connect();
    fx.send(
        id,
        ClientMessage::Login {
            user_id: 9,
            callsign: String::from("DLH9"),
            token: String::from("t"),
            role: Role::Pilot,
            protocol_version: 2,
            compression: Compression::Deflate,
            range_nm: Some(25.0),
            max_aircraft: None,
        },
    );
    fx.send(id, ClientMessage::Ping { nonce: 77 });
    let out = fx.drain();
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|o| o.immediate));
    assert_eq!(out[0].message, ServerMessage::ack("login"));
    assert!(matches!(out[1].message, ServerMessage::Pong { nonce: 77, .. }));

    let state = fx.registry.snapshot(id).unwrap().state;
    assert_eq!(state.user_id(), Some(9));
    assert_eq!(state.compression, Compression::Deflate);
    assert_eq!(state.range_nm, 25.0);
}

#[test]
fn test_login_with_empty_token_fails() {
    let mut fx = Fixture::new();
    let id = fx.connect();
    fx.send(
        id,
        ClientMessage::Login {
            user_id: 9,
            callsign: String::from("DLH9"),
            token: String::new(),
            role: Role::Pilot,
            protocol_version: 2,
            compression: Compression::None,
            range_nm: None,
            max_aircraft: None,
        },
    );
    let out = fx.drain();
    assert!(is_nack(&out[0].message));
    assert!(!fx.registry.snapshot(id).unwrap().state.is_authenticated());
}

#[test]
fn test_position_fans_out_by_range_and_role() {
    let mut fx = Fixture::new();
    let p = fx.login_with(Role::Pilot, 1, Some(50.0), None);
    let near = fx.login(Role::Pilot, 2);
    let far = fx.login(Role::Pilot, 3);
    let dispatcher = fx.login(Role::Dispatcher, 4);
    fx.move_to(near, 50.3, 8.0); // ~18nm
    fx.move_to(far, 52.0, 8.0); // ~120nm
    fx.move_to(dispatcher, 50.1, 8.0);
    fx.drain();

    fx.move_to(p, 50.0, 8.0);
    let out = fx.drain();
    assert!(to(&out, near).iter().any(|m| is_traffic_from(m, p)));
    assert!(!to(&out, far).iter().any(|m| is_traffic_from(m, p)));
    assert!(to(&out, dispatcher).is_empty());
    assert!(!to(&out, p).iter().any(|m| is_traffic_from(m, p)));
}

#[test]
fn test_viewer_gets_exclusive_traffic() {
    let mut fx = Fixture::new();
    let pilot = fx.login(Role::Pilot, 1);
    let near = fx.login(Role::Pilot, 2);
    let viewer = fx.login(Role::Viewer, 3);
    fx.move_to(near, 50.1, 8.0);
    fx.move_to(pilot, 50.0, 8.0);
    fx.send(viewer, ClientMessage::ViewerRequest { pilot_id: pilot });
    fx.send(pilot, ClientMessage::ViewerAccept { viewer_id: viewer });
    fx.drain();

    fx.move_to(pilot, 50.01, 8.0);
    let out = fx.drain();
    let traffic: Vec<_> = out
        .iter()
        .filter(|o| is_traffic_from(&o.message, pilot))
        .map(|o| o.target)
        .collect();
    assert_eq!(traffic, vec![viewer]);
}

#[test]
fn test_initial_snapshot_is_nearest_first_and_capped() {
    let mut fx = Fixture::new();
    let others: Vec<_> = [50.4, 50.1, 50.3, 50.2]
        .iter()
        .enumerate()
        .map(|(i, lat)| {
            let id = fx.login(Role::Pilot, 10 + i as UserId);
            fx.move_to(id, *lat, 8.0);
            (id, *lat)
        })
        .collect();
    fx.drain();

    let me = fx.login_with(Role::Pilot, 1, Some(100.0), Some(2));
    fx.move_to(me, 50.0, 8.0);
    let out = fx.drain();
    let snapshot: Vec<ConnectionId> = to(&out, me)
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Traffic { connection_id, .. } => Some(*connection_id),
            _ => None,
        })
        .collect();

    let nearest = |lat: f64| others.iter().find(|(_, l)| *l == lat).map(|(id, _)| *id).unwrap();
    assert_eq!(snapshot, vec![nearest(50.1), nearest(50.2)]);
    assert!(!fx.registry.snapshot(me).unwrap().state.snapshot_pending);

    // Only the first position after login carries the snapshot.
    fx.move_to(me, 50.0, 8.01);
    let out = fx.drain();
    assert!(to(&out, me).is_empty());
}

#[test]
fn test_service_request_offers_in_range_dispatchers() {
    let mut fx = Fixture::new();
    let pilot = fx.login(Role::Pilot, 1);
    let in_range = fx.login(Role::Dispatcher, 10);
    let out_of_range = fx.login(Role::Dispatcher, 11);
    let off_duty = fx.login(Role::Dispatcher, 12);
    fx.on_duty(in_range, 100.0, GeoPoint::new(50.5, 8.0));
    fx.on_duty(out_of_range, 10.0, GeoPoint::new(55.0, 8.0));
    fx.move_to(pilot, 50.0, 8.0);
    fx.drain();

    fx.send(pilot, ClientMessage::ServiceRequest { note: String::from("need taxi") });
    let out = fx.drain();
    assert!(matches!(
        to(&out, in_range).as_slice(),
        [ServerMessage::ServiceOffer { pilot_id, .. }] if *pilot_id == pilot
    ));
    assert!(to(&out, out_of_range).is_empty());
    assert!(to(&out, off_duty).is_empty());
    assert!(to(&out, pilot)
        .iter()
        .any(|m| *m == ServerMessage::notice("1 dispatchers out of range")));
    assert!(fx.registry.snapshot(pilot).unwrap().state.service_pending);
}

fn pilot_with_dispatchers(fx: &mut Fixture, count: usize) -> (ConnectionId, Vec<ConnectionId>) {
    let pilot = fx.login(Role::Pilot, 1);
    fx.move_to(pilot, 50.0, 8.0);
    let dispatchers: Vec<_> = (0..count)
        .map(|i| {
            let id = fx.login(Role::Dispatcher, 100 + i as UserId);
            fx.on_duty(id, 500.0, GeoPoint::new(50.0, 8.0));
            id
        })
        .collect();
    fx.send(pilot, ClientMessage::ServiceRequest { note: String::new() });
    fx.drain();
    (pilot, dispatchers)
}

#[test]
fn test_concurrent_accepts_bind_exactly_one() {
    let mut fx = Fixture::new();
    let (pilot, dispatchers) = pilot_with_dispatchers(&mut fx, 4);
    let barrier = Arc::new(Barrier::new(dispatchers.len()));

    let handles: Vec<_> = dispatchers
        .iter()
        .map(|&d| {
            let router = fx.router.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                router.handle(&Envelope::new(ClientMessage::ServiceAccept { pilot_id: pilot }, d, None));
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("accept thread");
    }

    let out = fx.drain();
    let bound: Vec<_> = to(&out, pilot)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::ServiceBound { .. }))
        .collect();
    assert_eq!(bound.len(), 1);

    let winner = fx.registry.snapshot(pilot).unwrap().state.dispatcher_id;
    assert!(dispatchers.contains(&winner));
    assert!(matches!(&bound[0], ServerMessage::ServiceBound { dispatcher_id, .. } if *dispatcher_id == winner));
    let losers_nacked = dispatchers
        .iter()
        .filter(|&&d| d != winner)
        .all(|&d| to(&out, d).iter().any(is_nack));
    assert!(losers_nacked);
    let losers_withdrawn = dispatchers
        .iter()
        .filter(|&&d| d != winner)
        .all(|&d| {
            to(&out, d)
                .iter()
                .any(|m| matches!(m, ServerMessage::ServiceCancelled { pilot_id: p, .. } if *p == pilot))
        });
    assert!(losers_withdrawn);
    assert!(!to(&out, winner).iter().any(is_nack));
    assert_eq!(fx.router.stats().dispatch_bindings, 1);
    assert!(!fx.registry.snapshot(pilot).unwrap().state.service_pending);
}

#[test]
fn test_accept_without_request_is_refused() {
    let mut fx = Fixture::new();
    let pilot = fx.login(Role::Pilot, 1);
    fx.move_to(pilot, 50.0, 8.0);
    let dispatcher = fx.login(Role::Dispatcher, 10);
    fx.on_duty(dispatcher, 500.0, GeoPoint::new(50.0, 8.0));
    fx.drain();

    fx.send(dispatcher, ClientMessage::ServiceAccept { pilot_id: pilot });
    let out = fx.drain();
    assert!(matches!(
        to(&out, dispatcher).as_slice(),
        [ServerMessage::Ack { request, ok: false, .. }] if request == "service_accept"
    ));
    assert!(to(&out, pilot).is_empty());
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.dispatcher_id, NO_CONNECTION);
    assert_eq!(fx.router.stats().dispatch_bindings, 0);
}

#[test]
fn test_off_duty_dispatcher_cannot_accept() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 1);
    let off_duty = fx.login(Role::Dispatcher, 50);

    fx.send(off_duty, ClientMessage::ServiceAccept { pilot_id: pilot });
    let out = fx.drain();
    assert!(to(&out, off_duty).iter().any(is_nack));
    assert!(to(&out, pilot).is_empty());
    let state = fx.registry.snapshot(pilot).unwrap().state;
    assert_eq!(state.dispatcher_id, NO_CONNECTION);
    assert!(state.service_pending);

    // The request is still open for an on-duty dispatcher.
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    fx.drain();
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.dispatcher_id, d[0]);
}

#[test]
fn test_late_accept_notifies_other_dispatchers() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 3);
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    fx.drain();

    fx.send(d[1], ClientMessage::ServiceAccept { pilot_id: pilot });
    let out = fx.drain();
    assert!(to(&out, d[1]).iter().any(is_nack));
    assert!(to(&out, d[2])
        .iter()
        .any(|m| matches!(m, ServerMessage::ServiceCancelled { .. })));
    assert!(to(&out, d[0]).is_empty());
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.dispatcher_id, d[0]);

    // Accepting again as the owner is a quiet no-op.
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    let out = fx.drain();
    assert_eq!(to(&out, d[0]), vec![ServerMessage::ack("service_accept")]);
    assert!(to(&out, pilot).is_empty());
}

#[test]
fn test_pilot_cancel_relays_to_dispatcher() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 2);
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    fx.drain();

    fx.send(
        pilot,
        ClientMessage::ServiceCancel {
            pilot_id: None,
            reason: String::from("changed plans"),
        },
    );
    let out = fx.drain();
    assert!(matches!(
        to(&out, d[0]).as_slice(),
        [ServerMessage::ServiceCancelled { reason, .. }] if reason == "changed plans"
    ));
    assert!(to(&out, d[1]).is_empty());
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.dispatcher_id, NO_CONNECTION);
    assert_eq!(fx.store.dispatch_records()[0].outcome, DispatchOutcome::Cancelled);
}

#[test]
fn test_dispatcher_cancel_relays_to_pilot() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 2);
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    fx.drain();

    // Not the bound dispatcher: refused, binding untouched.
    fx.send(
        d[1],
        ClientMessage::ServiceCancel {
            pilot_id: Some(pilot),
            reason: String::new(),
        },
    );
    let out = fx.drain();
    assert!(to(&out, d[1]).iter().any(is_nack));
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.dispatcher_id, d[0]);

    fx.send(
        d[0],
        ClientMessage::ServiceCancel {
            pilot_id: Some(pilot),
            reason: String::from("shift over"),
        },
    );
    let out = fx.drain();
    assert!(to(&out, pilot)
        .iter()
        .any(|m| matches!(m, ServerMessage::ServiceCancelled { reason, .. } if reason == "shift over")));
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.dispatcher_id, NO_CONNECTION);
}

#[test]
fn test_cancel_with_departed_dispatcher_is_broadcast() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 3);
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    fx.drain();

    let removal = fx.registry.remove(d[0]).expect("removed");
    fx.router.on_disconnect(&removal);
    let out = fx.drain();
    assert!(to(&out, pilot)
        .iter()
        .any(|m| matches!(m, ServerMessage::ServiceCancelled { .. })));

    fx.send(
        pilot,
        ClientMessage::ServiceCancel {
            pilot_id: None,
            reason: String::from("gone"),
        },
    );
    let out = fx.drain();
    for dispatcher in &d[1..] {
        assert!(to(&out, *dispatcher)
            .iter()
            .any(|m| matches!(m, ServerMessage::ServiceCancelled { .. })));
    }
}

#[test]
fn test_completion_follows_reconnected_dispatcher() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 1);
    let original = d[0];
    fx.send(original, ClientMessage::ServiceAccept { pilot_id: pilot });
    fx.drain();

    // Same user logs in again on a new connection.
    let reconnected = fx.login(Role::Dispatcher, 100);
    fx.on_duty(reconnected, 500.0, GeoPoint::new(50.0, 8.0));

    fx.send(pilot, ClientMessage::ServiceComplete { remarks: String::from("thanks") });
    let out = fx.drain();
    assert!(to(&out, reconnected)
        .iter()
        .any(|m| matches!(m, ServerMessage::ServiceCompleted { .. })));
    assert!(to(&out, original).is_empty());
    assert_eq!(to(&out, pilot), vec![ServerMessage::ack("service_complete")]);

    let records = fx.store.dispatch_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, DispatchOutcome::Completed);
    assert_eq!(records[0].dispatcher_user, Some(100));
}

#[test]
fn test_completion_persistence_failure_keeps_binding() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 1);
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    fx.drain();

    fx.store.set_failing(true);
    fx.send(pilot, ClientMessage::ServiceComplete { remarks: String::new() });
    let out = fx.drain();
    assert!(matches!(
        to(&out, pilot).as_slice(),
        [ServerMessage::Ack { ok: false, error: Some(_), .. }]
    ));
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.dispatcher_id, d[0]);
    assert_eq!(fx.router.stats().persistence_failures, 1);
}

#[test]
fn test_viewer_binding_lifecycle() {
    let mut fx = Fixture::new();
    let pilot = fx.login(Role::Pilot, 1);
    let v1 = fx.login(Role::Viewer, 2);
    let v2 = fx.login(Role::Viewer, 3);

    fx.send(v1, ClientMessage::ViewerRequest { pilot_id: pilot });
    let out = fx.drain();
    assert!(matches!(
        to(&out, pilot).as_slice(),
        [ServerMessage::ViewerRequested { viewer_id, .. }] if *viewer_id == v1
    ));

    fx.send(pilot, ClientMessage::ViewerAccept { viewer_id: v1 });
    let out = fx.drain();
    assert!(to(&out, v1)
        .iter()
        .any(|m| matches!(m, ServerMessage::ViewerBound { .. })));

    // Idempotent for the same viewer.
    fx.send(pilot, ClientMessage::ViewerAccept { viewer_id: v1 });
    let out = fx.drain();
    assert_eq!(to(&out, pilot), vec![ServerMessage::ack("viewer_accept")]);
    assert!(to(&out, v1).is_empty());

    // A different viewer is turned away.
    fx.send(v2, ClientMessage::ViewerRequest { pilot_id: pilot });
    let out = fx.drain();
    assert!(to(&out, v2)
        .iter()
        .any(|m| matches!(m, ServerMessage::ViewerRejected { .. })));
    assert!(to(&out, pilot).is_empty());
    fx.send(pilot, ClientMessage::ViewerAccept { viewer_id: v2 });
    fx.drain();
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.viewer_id, v1);

    // A viewer that is not bound cannot clear someone else's binding.
    fx.send(v2, ClientMessage::ViewerCancel { pilot_id: Some(pilot) });
    fx.drain();
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.viewer_id, v1);

    // The pilot side always clears.
    fx.send(pilot, ClientMessage::ViewerCancel { pilot_id: None });
    let out = fx.drain();
    assert!(to(&out, v1)
        .iter()
        .any(|m| matches!(m, ServerMessage::ViewerCancelled { .. })));
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.viewer_id, NO_CONNECTION);
}

#[test]
fn test_viewer_cannot_follow_two_pilots() {
    let mut fx = Fixture::new();
    let p1 = fx.login(Role::Pilot, 1);
    let p2 = fx.login(Role::Pilot, 2);
    let viewer = fx.login(Role::Viewer, 3);

    fx.send(viewer, ClientMessage::ViewerRequest { pilot_id: p1 });
    fx.send(p1, ClientMessage::ViewerAccept { viewer_id: viewer });
    fx.drain();

    fx.send(viewer, ClientMessage::ViewerRequest { pilot_id: p2 });
    let out = fx.drain();
    assert!(to(&out, viewer)
        .iter()
        .any(|m| matches!(m, ServerMessage::ViewerRejected { pilot_id, .. } if *pilot_id == p2)));
    assert!(to(&out, p2).is_empty());

    // Even if the second pilot accepts unprompted, the viewer stays with the first.
    fx.send(p2, ClientMessage::ViewerAccept { viewer_id: viewer });
    let out = fx.drain();
    assert!(to(&out, p2).iter().any(is_nack));
    assert!(!to(&out, viewer)
        .iter()
        .any(|m| matches!(m, ServerMessage::ViewerBound { .. })));
    assert_eq!(fx.registry.snapshot(p1).unwrap().state.viewer_id, viewer);
    assert_eq!(fx.registry.snapshot(p2).unwrap().state.viewer_id, NO_CONNECTION);
    assert_eq!(fx.router.stats().viewer_bindings, 1);

    // Released by the first pilot, the viewer may move on.
    fx.send(viewer, ClientMessage::ViewerCancel { pilot_id: Some(p1) });
    fx.send(p2, ClientMessage::ViewerAccept { viewer_id: viewer });
    fx.drain();
    assert_eq!(fx.registry.snapshot(p2).unwrap().state.viewer_id, viewer);
}

#[test]
fn test_bound_viewer_is_sole_position_recipient() {
    let mut fx = Fixture::new();
    let (pilot, d) = pilot_with_dispatchers(&mut fx, 1);
    fx.send(d[0], ClientMessage::ServiceAccept { pilot_id: pilot });
    let viewer = fx.login(Role::Viewer, 7);
    fx.send(pilot, ClientMessage::ViewerAccept { viewer_id: viewer });
    fx.drain();

    fx.move_to(pilot, 50.02, 8.0);
    let out = fx.drain();
    let traffic: Vec<_> = out
        .iter()
        .filter(|o| is_traffic_from(&o.message, pilot))
        .map(|o| o.target)
        .collect();
    assert_eq!(traffic, vec![viewer]);

    // Without a viewer the serving dispatcher tracks the pilot again.
    fx.send(pilot, ClientMessage::ViewerCancel { pilot_id: None });
    fx.drain();
    fx.move_to(pilot, 50.03, 8.0);
    let out = fx.drain();
    assert!(to(&out, d[0]).iter().any(|m| is_traffic_from(m, pilot)));
}

#[test]
fn test_viewer_disconnect_notifies_pilot() {
    let mut fx = Fixture::new();
    let pilot = fx.login(Role::Pilot, 1);
    let viewer = fx.login(Role::Viewer, 2);
    fx.send(pilot, ClientMessage::ViewerAccept { viewer_id: viewer });
    fx.drain();

    let removal = fx.registry.remove(viewer).expect("removed");
    fx.router.on_disconnect(&removal);
    let out = fx.drain();
    assert!(matches!(
        to(&out, pilot).as_slice(),
        [ServerMessage::ViewerCancelled { viewer_id, .. }] if *viewer_id == viewer
    ));
    assert_eq!(fx.registry.snapshot(pilot).unwrap().state.viewer_id, NO_CONNECTION);
}

#[test]
fn test_routes_persist_and_failures_nack() {
    let mut fx = Fixture::new();
    let pilot = fx.login(Role::Pilot, 1);
    fx.send(
        pilot,
        ClientMessage::SaveRoute {
            name: String::from("EDDF-EGLL"),
            waypoints: vec![String::from("TOBAK"), String::from("KONAN")],
        },
    );
    fx.send(pilot, ClientMessage::LoadRoutes);
    let out = fx.drain();
    let replies = to(&out, pilot);
    assert_eq!(replies[0], ServerMessage::ack("save_route"));
    assert!(matches!(&replies[1], ServerMessage::Routes { routes } if routes.len() == 1));

    fx.store.set_failing(true);
    fx.send(
        pilot,
        ClientMessage::SaveRoute {
            name: String::from("second"),
            waypoints: Vec::new(),
        },
    );
    let out = fx.drain();
    assert!(matches!(
        to(&out, pilot).as_slice(),
        [ServerMessage::Ack { request, ok: false, .. }] if request == "save_route"
    ));
    assert_eq!(fx.store.route_count(), 1);
}

#[test]
fn test_pilot_disconnect_clears_traffic_and_counts_misses() {
    let mut fx = Fixture::new();
    let pilot = fx.login(Role::Pilot, 1);
    let near = fx.login(Role::Pilot, 2);
    fx.move_to(near, 50.1, 8.0);
    fx.move_to(pilot, 50.0, 8.0);
    fx.drain();

    let removal = fx.registry.remove(pilot).expect("removed");
    fx.router.on_disconnect(&removal);
    let out = fx.drain();
    assert!(to(&out, near)
        .iter()
        .any(|m| *m == ServerMessage::TrafficRemoved { connection_id: pilot }));

    // Messages still in flight from the departed connection are dropped.
    fx.move_to(pilot, 50.0, 8.0);
    assert!(fx.drain().is_empty());
    assert_eq!(fx.router.stats().stale_senders, 1);

    let misses = fx.router.stats().routing_misses;
    fx.router.outbox().push_to(ServerMessage::notice("hello"), pilot);
    assert_eq!(fx.router.stats().routing_misses, misses + 1);
}
