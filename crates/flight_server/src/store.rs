//! Persistence boundary.
//!
//! Handlers open a [`Transaction`] through [`Store::begin`], stage their
//! writes and commit. Any failure is a typed [`StoreError`] that the router
//! turns into a negative acknowledgement; the transaction is rolled back.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the tests. Writes are staged on the transaction and only applied on
//! commit.

use crate::connection::UserId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A named route a user saved for later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRoute {
    pub name: String,
    pub waypoints: Vec<String>,
}

/// How a dispatch service ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed,
    Cancelled,
}

/// Audit record of one finished dispatch service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub pilot_user: Option<UserId>,
    pub dispatcher_user: Option<UserId>,
    pub outcome: DispatchOutcome,
    pub remarks: String,
    pub recorded_at_ms: u64,
}

/// Errors raised by a persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The data was rejected by the backend
    #[error("Invalid data: {0}")]
    Invalid(String),

    /// The transaction could not be committed
    #[error("Commit failed: {0}")]
    Commit(String),
}

/// A unit of work against the store.
pub trait Transaction: Send {
    /// Stages a route for `user`, replacing any route with the same name.
    fn save_route(&mut self, user: UserId, route: SavedRoute) -> Result<(), StoreError>;

    /// Routes of `user`, including writes staged on this transaction.
    fn load_routes(&mut self, user: UserId) -> Result<Vec<SavedRoute>, StoreError>;

    fn record_dispatch(&mut self, record: DispatchRecord) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>);
}

/// Persistence backend.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryData {
    routes: HashMap<UserId, Vec<SavedRoute>>,
    dispatches: Vec<DispatchRecord>,
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent commit fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn dispatch_records(&self) -> Vec<DispatchRecord> {
        self.data.lock().dispatches.clone()
    }

    pub fn route_count(&self) -> usize {
        self.data.lock().routes.values().map(Vec::len).sum()
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            routes: Vec::new(),
            dispatches: Vec::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    routes: Vec<(UserId, SavedRoute)>,
    dispatches: Vec<DispatchRecord>,
}

fn upsert(routes: &mut Vec<SavedRoute>, route: SavedRoute) {
    match routes.iter_mut().find(|r| r.name == route.name) {
        Some(existing) => *existing = route,
        None => routes.push(route),
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn save_route(&mut self, user: UserId, route: SavedRoute) -> Result<(), StoreError> {
        if route.name.trim().is_empty() {
            return Err(StoreError::Invalid(String::from("route name is empty")));
        }
        self.routes.push((user, route));
        Ok(())
    }

    fn load_routes(&mut self, user: UserId) -> Result<Vec<SavedRoute>, StoreError> {
        let mut routes = self.store.data.lock().routes.get(&user).cloned().unwrap_or_default();
        for (owner, route) in &self.routes {
            if *owner == user {
                upsert(&mut routes, route.clone());
            }
        }
        Ok(routes)
    }

    fn record_dispatch(&mut self, record: DispatchRecord) -> Result<(), StoreError> {
        self.dispatches.push(record);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.store.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Commit(String::from("backend refused the write")));
        }
        let this = *self;
        let mut data = this.store.data.lock();
        debug!(
            "💾 Committing {} route(s) and {} dispatch record(s)",
            this.routes.len(),
            this.dispatches.len()
        );
        for (user, route) in this.routes {
            upsert(data.routes.entry(user).or_default(), route);
        }
        data.dispatches.extend(this.dispatches);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!(
            "↩️ Rolling back {} staged write(s)",
            self.routes.len() + self.dispatches.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str) -> SavedRoute {
        SavedRoute {
            name: name.to_string(),
            waypoints: vec![String::from("EDDF"), String::from("EDDM")],
        }
    }

    #[test]
    fn test_writes_apply_only_on_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.save_route(7, route("home")).unwrap();
        assert_eq!(tx.load_routes(7).unwrap().len(), 1);
        tx.rollback();
        assert_eq!(store.route_count(), 0);

        let mut tx = store.begin().unwrap();
        tx.save_route(7, route("home")).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.route_count(), 1);
    }

    #[test]
    fn test_same_name_replaces() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.save_route(1, route("a")).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let mut updated = route("a");
        updated.waypoints.push(String::from("LOWW"));
        tx.save_route(1, updated.clone()).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(tx.load_routes(1).unwrap(), vec![updated]);
    }

    #[test]
    fn test_failing_commit_keeps_nothing() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let mut tx = store.begin().unwrap();
        tx.save_route(1, route("a")).unwrap();
        assert!(matches!(tx.commit(), Err(StoreError::Commit(_))));
        assert_eq!(store.route_count(), 0);
    }

    #[test]
    fn test_empty_name_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        assert!(matches!(tx.save_route(1, route(" ")), Err(StoreError::Invalid(_))));
    }
}
