use super::*;
use crate::geo::GeoPoint;
use crate::messaging::Position;
use std::sync::{Arc, Barrier};
use std::thread;

fn register(registry: &ConnectionRegistry, role: Role, user: UserId, at: Option<GeoPoint>) -> ConnectionId {
    let id = registry.allocate_id();
    let mut state = ConnectionState::new(50.0, 100, 300.0);
    state.role = role;
    state.user = Some(UserRef {
        user_id: user,
        callsign: format!("U{user}"),
    });
    state.position = at.map(|location| Position {
        location,
        heading: 0.0,
        ground_speed_kts: 0.0,
        on_ground: false,
    });
    registry
        .add(Connection::new(id, None, state))
        .expect("fresh id registers");
    id
}

fn request_service(registry: &ConnectionRegistry, pilot: ConnectionId) {
    registry
        .update(pilot, |s| s.service_pending = true)
        .expect("pilot registered");
}

fn viewing(registry: &ConnectionRegistry, viewer: ConnectionId) -> ConnectionId {
    registry.snapshot(viewer).expect("viewer registered").state.viewing
}

#[test]
fn test_ids_are_unique_and_duplicates_rejected() {
    let registry = ConnectionRegistry::new();
    let a = registry.allocate_id();
    let b = registry.allocate_id();
    assert_ne!(a, b);
    assert!(a >= 1);

    registry
        .add(Connection::new(a, None, ConnectionState::new(10.0, 10, 10.0)))
        .expect("first add");
    let err = registry
        .add(Connection::new(a, None, ConnectionState::new(10.0, 10, 10.0)))
        .expect_err("duplicate add");
    assert_eq!(err, crate::error::RegistryError::DuplicateConnection(a));
}

#[test]
fn test_removal_is_terminal() {
    let registry = ConnectionRegistry::new();
    let id = register(&registry, Role::Pilot, 1, None);
    let handle = registry.get(id).expect("registered");

    let removal = registry.remove(id).expect("removed");
    assert_eq!(removal.snapshot.id, id);
    assert!(handle.is_closed());
    assert!(registry.get(id).is_none());
    assert!(registry.remove(id).is_none());
    assert!(registry.update(id, |_| ()).is_err());
    assert!(registry.get_by_user(1, None).is_none());
}

#[test]
fn test_removing_viewer_clears_pilot_binding() {
    let registry = ConnectionRegistry::new();
    let pilot = register(&registry, Role::Pilot, 1, None);
    let viewer = register(&registry, Role::Viewer, 2, None);
    assert_eq!(registry.bind_viewer(pilot, viewer), Ok(ViewerBind::Bound));

    let removal = registry.remove(viewer).expect("removed");
    assert_eq!(
        removal.cleared,
        vec![ClearedBinding {
            connection_id: pilot,
            kind: BindingKind::Viewer
        }]
    );
    let pilot_state = registry.snapshot(pilot).expect("pilot still live").state;
    assert_eq!(pilot_state.viewer_id, NO_CONNECTION);
}

#[test]
fn test_removing_dispatcher_clears_every_pilot() {
    let registry = ConnectionRegistry::new();
    let dispatcher = register(&registry, Role::Dispatcher, 10, None);
    let p1 = register(&registry, Role::Pilot, 1, None);
    let p2 = register(&registry, Role::Pilot, 2, None);
    request_service(&registry, p1);
    request_service(&registry, p2);
    assert_eq!(registry.bind_dispatcher(p1, dispatcher), Ok(DispatchBind::Bound));
    assert_eq!(registry.bind_dispatcher(p2, dispatcher), Ok(DispatchBind::Bound));

    let removal = registry.remove(dispatcher).expect("removed");
    assert_eq!(removal.cleared.len(), 2);
    for pilot in [p1, p2] {
        let state = registry.snapshot(pilot).expect("live").state;
        assert_eq!(state.dispatcher_id, NO_CONNECTION);
        assert_eq!(state.dispatcher_user, None);
    }
}

#[test]
fn test_dispatcher_bind_first_wins() {
    let registry = ConnectionRegistry::new();
    let pilot = register(&registry, Role::Pilot, 1, None);
    let d1 = register(&registry, Role::Dispatcher, 10, None);
    let d2 = register(&registry, Role::Dispatcher, 11, None);
    request_service(&registry, pilot);

    assert_eq!(registry.bind_dispatcher(pilot, d1), Ok(DispatchBind::Bound));
    assert_eq!(registry.bind_dispatcher(pilot, d1), Ok(DispatchBind::AlreadyBound));
    assert_eq!(registry.bind_dispatcher(pilot, d2), Ok(DispatchBind::Taken(d1)));

    let state = registry.snapshot(pilot).expect("live").state;
    assert_eq!(state.dispatcher_id, d1);
    assert_eq!(state.dispatcher_user, Some(10));
    assert!(!state.service_pending);
}

#[test]
fn test_dispatcher_bind_needs_open_request() {
    let registry = ConnectionRegistry::new();
    let pilot = register(&registry, Role::Pilot, 1, None);
    let dispatcher = register(&registry, Role::Dispatcher, 10, None);

    assert_eq!(registry.bind_dispatcher(pilot, dispatcher), Ok(DispatchBind::NotRequested));
    assert_eq!(registry.snapshot(pilot).expect("live").state.dispatcher_id, NO_CONNECTION);

    request_service(&registry, pilot);
    assert_eq!(registry.bind_dispatcher(pilot, dispatcher), Ok(DispatchBind::Bound));

    // Once released the pilot has to ask again.
    registry.clear_dispatcher(pilot, None).expect("was bound");
    assert_eq!(registry.bind_dispatcher(pilot, dispatcher), Ok(DispatchBind::NotRequested));
}

#[test]
fn test_concurrent_dispatcher_binds_have_one_winner() {
    for _ in 0..50 {
        let registry = Arc::new(ConnectionRegistry::new());
        let pilot = register(&registry, Role::Pilot, 1, None);
        let dispatchers: Vec<_> = (0..4)
            .map(|i| register(&registry, Role::Dispatcher, 10 + i, None))
            .collect();
        request_service(&registry, pilot);
        let barrier = Arc::new(Barrier::new(dispatchers.len()));

        let outcomes: Vec<DispatchBind> = dispatchers
            .iter()
            .map(|&d| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.bind_dispatcher(pilot, d).expect("both live")
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        let winners = outcomes.iter().filter(|o| **o == DispatchBind::Bound).count();
        assert_eq!(winners, 1);
        let bound = registry.snapshot(pilot).expect("live").state.dispatcher_id;
        assert!(dispatchers.contains(&bound));
    }
}

#[test]
fn test_clear_dispatcher_respects_expected() {
    let registry = ConnectionRegistry::new();
    let pilot = register(&registry, Role::Pilot, 1, None);
    let d1 = register(&registry, Role::Dispatcher, 10, None);
    let d2 = register(&registry, Role::Dispatcher, 11, None);
    request_service(&registry, pilot);
    registry.bind_dispatcher(pilot, d1).expect("bind");

    assert_eq!(registry.clear_dispatcher(pilot, Some(d2)), None);
    assert_eq!(registry.clear_dispatcher(pilot, Some(d1)), Some((d1, Some(10))));
    assert_eq!(registry.clear_dispatcher(pilot, None), None);
}

#[test]
fn test_viewer_binding_rules() {
    let registry = ConnectionRegistry::new();
    let pilot = register(&registry, Role::Pilot, 1, None);
    let v1 = register(&registry, Role::Viewer, 2, None);
    let v2 = register(&registry, Role::Viewer, 3, None);

    assert_eq!(registry.bind_viewer(pilot, v1), Ok(ViewerBind::Bound));
    assert_eq!(registry.bind_viewer(pilot, v1), Ok(ViewerBind::AlreadyBound));
    assert_eq!(registry.bind_viewer(pilot, v2), Ok(ViewerBind::Rejected(v1)));

    assert_eq!(registry.clear_viewer(pilot, Some(v2)), None);
    assert_eq!(registry.clear_viewer(pilot, Some(v1)), Some(v1));
    assert_eq!(registry.bind_viewer(pilot, v2), Ok(ViewerBind::Bound));
    assert_eq!(registry.clear_viewer(pilot, None), Some(v2));
    assert_eq!(viewing(&registry, v2), NO_CONNECTION);
}

#[test]
fn test_viewer_follows_one_pilot_at_a_time() {
    let registry = ConnectionRegistry::new();
    let p1 = register(&registry, Role::Pilot, 1, None);
    let p2 = register(&registry, Role::Pilot, 2, None);
    let viewer = register(&registry, Role::Viewer, 3, None);

    assert_eq!(registry.bind_viewer(p1, viewer), Ok(ViewerBind::Bound));
    assert_eq!(viewing(&registry, viewer), p1);
    assert_eq!(registry.bind_viewer(p2, viewer), Ok(ViewerBind::Following(p1)));
    assert_eq!(registry.snapshot(p2).expect("live").state.viewer_id, NO_CONNECTION);

    assert_eq!(registry.clear_viewer(p1, Some(viewer)), Some(viewer));
    assert_eq!(registry.bind_viewer(p2, viewer), Ok(ViewerBind::Bound));
    assert_eq!(viewing(&registry, viewer), p2);
}

#[test]
fn test_rejected_viewer_stays_free() {
    let registry = ConnectionRegistry::new();
    let p1 = register(&registry, Role::Pilot, 1, None);
    let p2 = register(&registry, Role::Pilot, 2, None);
    let v1 = register(&registry, Role::Viewer, 3, None);
    let v2 = register(&registry, Role::Viewer, 4, None);

    assert_eq!(registry.bind_viewer(p1, v1), Ok(ViewerBind::Bound));
    assert_eq!(registry.bind_viewer(p1, v2), Ok(ViewerBind::Rejected(v1)));
    assert_eq!(viewing(&registry, v2), NO_CONNECTION);
    assert_eq!(registry.bind_viewer(p2, v2), Ok(ViewerBind::Bound));
}

#[test]
fn test_removing_pilot_frees_its_viewer() {
    let registry = ConnectionRegistry::new();
    let p1 = register(&registry, Role::Pilot, 1, None);
    let p2 = register(&registry, Role::Pilot, 2, None);
    let viewer = register(&registry, Role::Viewer, 3, None);
    assert_eq!(registry.bind_viewer(p1, viewer), Ok(ViewerBind::Bound));

    registry.remove(p1).expect("removed");
    assert_eq!(viewing(&registry, viewer), NO_CONNECTION);
    assert_eq!(registry.bind_viewer(p2, viewer), Ok(ViewerBind::Bound));
}

#[test]
fn test_concurrent_viewer_binds_have_one_winner() {
    for _ in 0..50 {
        let registry = Arc::new(ConnectionRegistry::new());
        let viewer = register(&registry, Role::Viewer, 1, None);
        let pilots: Vec<_> = (0..4)
            .map(|i| register(&registry, Role::Pilot, 10 + i, None))
            .collect();
        let barrier = Arc::new(Barrier::new(pilots.len()));

        let outcomes: Vec<ViewerBind> = pilots
            .iter()
            .map(|&p| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.bind_viewer(p, viewer).expect("both live")
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        let winners = outcomes.iter().filter(|o| **o == ViewerBind::Bound).count();
        assert_eq!(winners, 1);
        let followed: Vec<_> = pilots
            .iter()
            .filter(|&&p| registry.snapshot(p).expect("live").state.viewer_id == viewer)
            .copied()
            .collect();
        assert_eq!(followed, vec![viewing(&registry, viewer)]);
    }
}

#[test]
fn test_bind_to_missing_connection_fails() {
    let registry = ConnectionRegistry::new();
    let pilot = register(&registry, Role::Pilot, 1, None);
    assert!(registry.bind_dispatcher(pilot, 999).is_err());
    assert!(registry.bind_viewer(pilot, 999).is_err());
    assert!(registry.bind_dispatcher(999, pilot).is_err());
}

#[test]
fn test_get_by_user_prefers_newest_connection() {
    let registry = ConnectionRegistry::new();
    let old = register(&registry, Role::Dispatcher, 10, None);
    let new = register(&registry, Role::Dispatcher, 10, None);
    let _other_role = register(&registry, Role::Pilot, 10, None);

    let found = registry.get_by_user(10, Some(Role::Dispatcher)).expect("found");
    assert_eq!(found.id, new);
    assert!(found.id > old);
}

#[test]
fn test_proximity_queries() {
    let registry = ConnectionRegistry::new();
    let origin = GeoPoint::new(50.0, 8.0);
    // ~30nm and ~90nm north of the origin.
    let near = register(&registry, Role::Pilot, 1, Some(GeoPoint::new(50.5, 8.0)));
    let far = register(&registry, Role::Pilot, 2, Some(GeoPoint::new(51.5, 8.0)));
    let _nowhere = register(&registry, Role::Pilot, 3, None);

    let found = registry.within(&origin, 100.0, |_| true);
    let ids: Vec<_> = found.iter().map(|(c, _)| c.id).collect();
    assert_eq!(ids, vec![near, far]);
    assert!(found[0].1 < found[1].1);

    // Each candidate uses its own 50nm radius.
    let in_range: Vec<_> = registry.in_range(&origin).into_iter().map(|c| c.id).collect();
    assert_eq!(in_range, vec![near]);
}

#[test]
fn test_role_counts() {
    let registry = ConnectionRegistry::new();
    register(&registry, Role::Pilot, 1, None);
    register(&registry, Role::Pilot, 2, None);
    register(&registry, Role::Dispatcher, 3, None);
    register(&registry, Role::Viewer, 4, None);
    let counts = registry.role_counts();
    assert_eq!(counts.pilots, 2);
    assert_eq!(counts.dispatchers, 1);
    assert_eq!(counts.viewers, 1);
    assert_eq!(counts.total(), registry.len());
}
