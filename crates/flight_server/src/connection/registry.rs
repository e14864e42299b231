//! Registry of all live connections.
//!
//! The registry is the single source of mutable shared state in the core.
//! Lookups go straight to a sharded [`DashMap`]; structural changes (add and
//! remove) take the registry's structural write lock so that removal and its
//! binding cascade are atomic with respect to every bind/clear entry point,
//! which run under the structural read lock.
//!
//! All queries hand out [`ConnectionSnapshot`]s so callers can broadcast
//! while iterating without holding any registry lock.

use super::client::{Connection, ConnectionSnapshot, ConnectionState};
use super::{ConnectionId, Role, UserId, NO_CONNECTION};
use crate::error::RegistryError;
use crate::geo::GeoPoint;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Which binding field was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Dispatcher,
    Viewer,
}

/// A binding on another connection that pointed at a removed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearedBinding {
    /// The connection whose field was reset
    pub connection_id: ConnectionId,
    pub kind: BindingKind,
}

/// Result of [`ConnectionRegistry::remove`].
#[derive(Debug, Clone)]
pub struct Removal {
    /// Final state of the removed connection
    pub snapshot: ConnectionSnapshot,
    /// Bindings on other connections that referenced it and were reset
    pub cleared: Vec<ClearedBinding>,
}

/// Outcome of a dispatcher bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchBind {
    /// The pilot was unbound and is now bound to the dispatcher
    Bound,
    /// The pilot was already bound to this same dispatcher
    AlreadyBound,
    /// Another dispatcher got there first
    Taken(ConnectionId),
    /// The pilot is unbound but has no open service request
    NotRequested,
}

/// Outcome of a viewer bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerBind {
    Bound,
    /// Same viewer again; nothing changed
    AlreadyBound,
    /// The pilot already has a different viewer
    Rejected(ConnectionId),
    /// The viewer already follows another pilot
    Following(ConnectionId),
}

/// Live connection counts per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub unidentified: usize,
    pub pilots: usize,
    pub dispatchers: usize,
    pub atc: usize,
    pub viewers: usize,
}

impl RoleCounts {
    pub fn total(&self) -> usize {
        self.unidentified + self.pilots + self.dispatchers + self.atc + self.viewers
    }
}

/// Concurrent map of all live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    structure: RwLock<()>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            structure: RwLock::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Hands out the next connection id. Ids are never reused.
    pub fn allocate_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a connection.
    ///
    /// # Arguments
    ///
    /// * `connection` - Freshly accepted connection, id from [`allocate_id`](Self::allocate_id)
    ///
    /// # Returns
    ///
    /// The shared handle now held by the registry, or
    /// `RegistryError::DuplicateConnection` if the id is already present.
    pub fn add(&self, connection: Connection) -> Result<Arc<Connection>, RegistryError> {
        let _structure = self.structure.write();
        let id = connection.id();
        match self.connections.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegistryError::DuplicateConnection(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let connection = Arc::new(connection);
                slot.insert(connection.clone());
                debug!("🔗 Registered connection {}", id);
                Ok(connection)
            }
        }
    }

    /// Closes and evicts a connection, clearing every binding that pointed at it.
    ///
    /// Removal is terminal: once this returns no registry operation observes
    /// the id again.
    ///
    /// # Arguments
    ///
    /// * `id` - Connection to remove
    ///
    /// # Returns
    ///
    /// The final snapshot plus the bindings that were reset on other
    /// connections, or `None` if the id was not registered.
    pub fn remove(&self, id: ConnectionId) -> Option<Removal> {
        let _structure = self.structure.write();
        let (_, connection) = self.connections.remove(&id)?;
        connection.mark_closed();

        let mut cleared = Vec::new();
        for other in self.handles() {
            other.write(|state| {
                if state.dispatcher_id == id {
                    state.dispatcher_id = NO_CONNECTION;
                    state.dispatcher_user = None;
                    cleared.push(ClearedBinding {
                        connection_id: other.id(),
                        kind: BindingKind::Dispatcher,
                    });
                }
                if state.viewer_id == id {
                    state.viewer_id = NO_CONNECTION;
                    cleared.push(ClearedBinding {
                        connection_id: other.id(),
                        kind: BindingKind::Viewer,
                    });
                }
                // The viewer hears about a departed pilot through the pilot's own snapshot.
                if state.viewing == id {
                    state.viewing = NO_CONNECTION;
                }
            });
        }

        let snapshot = connection.snapshot();
        info!(
            "❌ Connection {} ({}) removed, {} binding(s) cleared",
            id,
            snapshot.state.role,
            cleared.len()
        );
        Some(Removal { snapshot, cleared })
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn snapshot(&self, id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.get(id).map(|c| c.snapshot())
    }

    /// Newest live connection of a user, optionally restricted to one role.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Account to look up
    /// * `role` - Only consider connections logged in with this role
    ///
    /// # Returns
    ///
    /// The matching connection with the highest id, if any.
    pub fn get_by_user(&self, user_id: UserId, role: Option<Role>) -> Option<ConnectionSnapshot> {
        self.get_all(|c| {
            c.state.user_id() == Some(user_id) && role.map_or(true, |r| c.state.role == r)
        })
        .into_iter()
        .max_by_key(|c| c.id)
    }

    /// Snapshots of every connection matching `predicate`.
    pub fn get_all(&self, predicate: impl Fn(&ConnectionSnapshot) -> bool) -> Vec<ConnectionSnapshot> {
        self.handles()
            .into_iter()
            .map(|c| c.snapshot())
            .filter(|c| predicate(c))
            .collect()
    }

    /// Connections whose own proximity radius contains `point`.
    pub fn in_range(&self, point: &GeoPoint) -> Vec<ConnectionSnapshot> {
        self.get_all(|c| {
            c.distance_to(point)
                .map_or(false, |distance| distance <= c.state.range_nm)
        })
    }

    /// Connections within `radius_nm` of `point` that match `predicate`.
    ///
    /// Connections without a position are skipped.
    ///
    /// # Arguments
    ///
    /// * `point` - Center of the search
    /// * `radius_nm` - Search radius in nautical miles, inclusive
    /// * `predicate` - Filter applied to each snapshot before measuring
    ///
    /// # Returns
    ///
    /// Matches paired with their distance, nearest first, ties broken by id.
    pub fn within(
        &self,
        point: &GeoPoint,
        radius_nm: f64,
        predicate: impl Fn(&ConnectionSnapshot) -> bool,
    ) -> Vec<(ConnectionSnapshot, f64)> {
        let mut found: Vec<(ConnectionSnapshot, f64)> = self
            .handles()
            .into_iter()
            .map(|c| c.snapshot())
            .filter(|c| predicate(c))
            .filter_map(|c| {
                let distance = c.distance_to(point)?;
                (distance <= radius_nm).then_some((c, distance))
            })
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
        found
    }

    /// Applies `f` to a connection's own state.
    ///
    /// # Arguments
    ///
    /// * `id` - Connection to update
    /// * `f` - Mutation run under the connection's state lock
    ///
    /// # Returns
    ///
    /// Whatever `f` returns, or `RegistryError::NotFound` if the connection is gone.
    pub fn update<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Result<R, RegistryError> {
        let connection = self.get(id).ok_or(RegistryError::NotFound(id))?;
        Ok(connection.write(f))
    }

    /// Binds `dispatcher` to `pilot` if the pilot has no dispatcher yet.
    ///
    /// The check and the write happen under the pilot's state lock, so of
    /// any number of concurrent accepts exactly one observes `Bound`. A bind
    /// only succeeds while the pilot has an open service request, which it
    /// closes.
    ///
    /// # Arguments
    ///
    /// * `pilot` - Connection asking for service
    /// * `dispatcher` - Connection accepting it
    ///
    /// # Returns
    ///
    /// * `Ok(DispatchBind)` - How the attempt resolved
    /// * `Err(RegistryError::NotFound)` - Either side is not registered
    pub fn bind_dispatcher(
        &self,
        pilot: ConnectionId,
        dispatcher: ConnectionId,
    ) -> Result<DispatchBind, RegistryError> {
        let _structure = self.structure.read();
        let dispatcher_conn = self.get(dispatcher).ok_or(RegistryError::NotFound(dispatcher))?;
        let dispatcher_user = dispatcher_conn.read(|s| s.user_id());
        let pilot_conn = self.get(pilot).ok_or(RegistryError::NotFound(pilot))?;

        Ok(pilot_conn.write(|state| {
            if state.dispatcher_id == dispatcher {
                DispatchBind::AlreadyBound
            } else if state.dispatcher_id != NO_CONNECTION {
                DispatchBind::Taken(state.dispatcher_id)
            } else if !state.service_pending {
                DispatchBind::NotRequested
            } else {
                state.dispatcher_id = dispatcher;
                state.dispatcher_user = dispatcher_user;
                state.service_pending = false;
                DispatchBind::Bound
            }
        }))
    }

    /// Clears a pilot's dispatcher binding.
    ///
    /// # Arguments
    ///
    /// * `pilot` - Pilot whose binding is cleared
    /// * `expected` - When set, only clear if the binding still points at this dispatcher
    ///
    /// # Returns
    ///
    /// The dispatcher id and user that were cleared, or `None` if nothing changed.
    pub fn clear_dispatcher(
        &self,
        pilot: ConnectionId,
        expected: Option<ConnectionId>,
    ) -> Option<(ConnectionId, Option<UserId>)> {
        let _structure = self.structure.read();
        let pilot_conn = self.get(pilot)?;
        pilot_conn.write(|state| {
            if state.dispatcher_id == NO_CONNECTION {
                return None;
            }
            if expected.map_or(false, |e| e != state.dispatcher_id) {
                return None;
            }
            let previous = (state.dispatcher_id, state.dispatcher_user.take());
            state.dispatcher_id = NO_CONNECTION;
            Some(previous)
        })
    }

    /// Binds `viewer` to `pilot`.
    ///
    /// Viewing is one-to-one in both directions. The viewer is claimed
    /// first, under its own state lock, and the claim is released again if
    /// the pilot turns out to have a different viewer. Two pilots racing to
    /// accept the same viewer therefore cannot both win.
    ///
    /// # Arguments
    ///
    /// * `pilot` - Pilot being followed
    /// * `viewer` - Spectator that wants to follow it
    ///
    /// # Returns
    ///
    /// * `Ok(ViewerBind)` - How the attempt resolved
    /// * `Err(RegistryError::NotFound)` - Either side is not registered
    pub fn bind_viewer(
        &self,
        pilot: ConnectionId,
        viewer: ConnectionId,
    ) -> Result<ViewerBind, RegistryError> {
        let _structure = self.structure.read();
        let viewer_conn = self.get(viewer).ok_or(RegistryError::NotFound(viewer))?;
        let pilot_conn = self.get(pilot).ok_or(RegistryError::NotFound(pilot))?;

        let claimed = viewer_conn.write(|state| {
            if state.viewing == NO_CONNECTION {
                state.viewing = pilot;
                Ok(true)
            } else if state.viewing == pilot {
                Ok(false)
            } else {
                Err(state.viewing)
            }
        });
        let newly_claimed = match claimed {
            Ok(newly_claimed) => newly_claimed,
            Err(other) => return Ok(ViewerBind::Following(other)),
        };

        let outcome = pilot_conn.write(|state| {
            if state.viewer_id == NO_CONNECTION {
                state.viewer_id = viewer;
                ViewerBind::Bound
            } else if state.viewer_id == viewer {
                ViewerBind::AlreadyBound
            } else {
                ViewerBind::Rejected(state.viewer_id)
            }
        });
        if newly_claimed && matches!(outcome, ViewerBind::Rejected(_)) {
            viewer_conn.write(|state| {
                if state.viewing == pilot {
                    state.viewing = NO_CONNECTION;
                }
            });
        }
        Ok(outcome)
    }

    /// Clears a pilot's viewer binding and the viewer's side of it.
    ///
    /// # Arguments
    ///
    /// * `pilot` - Pilot whose viewer is dropped
    /// * `expected` - When set, only clear if the binding still points at this viewer
    ///
    /// # Returns
    ///
    /// The viewer that was cleared, or `None` if nothing changed.
    pub fn clear_viewer(&self, pilot: ConnectionId, expected: Option<ConnectionId>) -> Option<ConnectionId> {
        let _structure = self.structure.read();
        let pilot_conn = self.get(pilot)?;
        let previous = pilot_conn.write(|state| {
            if state.viewer_id == NO_CONNECTION {
                return None;
            }
            if expected.map_or(false, |e| e != state.viewer_id) {
                return None;
            }
            let previous = state.viewer_id;
            state.viewer_id = NO_CONNECTION;
            Some(previous)
        })?;
        if let Some(viewer_conn) = self.get(previous) {
            viewer_conn.write(|state| {
                if state.viewing == pilot {
                    state.viewing = NO_CONNECTION;
                }
            });
        }
        Some(previous)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn role_counts(&self) -> RoleCounts {
        let mut counts = RoleCounts::default();
        for connection in self.handles() {
            match connection.read(|s| s.role) {
                Role::Unidentified => counts.unidentified += 1,
                Role::Pilot => counts.pilots += 1,
                Role::Dispatcher => counts.dispatchers += 1,
                Role::Atc => counts.atc += 1,
                Role::Viewer => counts.viewers += 1,
            }
        }
        counts
    }

    /// Clones the connection handles out of the map so no shard lock is held
    /// while connection locks are taken.
    fn handles(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
