//! Routing primitives.
//!
//! Handlers never touch sockets. They hand [`ServerMessage`]s to the
//! [`Outbox`], which resolves the target against the registry and forwards
//! the message to the enrichment stage over an unbounded channel, so pool
//! threads never wait on the async side.

use crate::connection::{ConnectionId, ConnectionRegistry, Role};
use crate::messaging::{Envelope, Outbound, ServerMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Delivery side of the router.
#[derive(Debug, Clone)]
pub struct Outbox {
    registry: Arc<ConnectionRegistry>,
    sender: mpsc::UnboundedSender<Outbound>,
    delivered: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl Outbox {
    pub fn new(registry: Arc<ConnectionRegistry>, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            registry,
            sender,
            delivered: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replies to the sender of `envelope`.
    pub fn push(&self, envelope: &Envelope, message: ServerMessage) -> bool {
        self.push_to(message, envelope.sender)
    }

    /// Unicast. A target that is no longer registered is counted and skipped.
    pub fn push_to(&self, message: ServerMessage, target: ConnectionId) -> bool {
        self.deliver(message, target, false)
    }

    /// Unicast that bypasses write batching.
    pub fn push_immediate(&self, message: ServerMessage, target: ConnectionId) -> bool {
        self.deliver(message, target, true)
    }

    /// Sends to every on-duty dispatcher. Returns how many were reached.
    pub fn push_dispatch(&self, message: ServerMessage) -> usize {
        self.push_dispatch_except(message, None)
    }

    /// Sends to every on-duty dispatcher except `skip`.
    pub fn push_dispatch_except(&self, message: ServerMessage, skip: Option<ConnectionId>) -> usize {
        let dispatchers = self
            .registry
            .get_all(|c| c.state.is_on_duty_dispatcher() && Some(c.id) != skip);
        let mut reached = 0;
        for dispatcher in dispatchers {
            if self.push_to(message.clone(), dispatcher.id) {
                reached += 1;
            }
        }
        reached
    }

    /// Unicast to a dispatcher. Dropped unless the target is live and still
    /// logged in as a dispatcher.
    pub fn push_dispatch_to(&self, message: ServerMessage, dispatcher_id: ConnectionId) -> bool {
        let is_dispatcher = self
            .registry
            .get(dispatcher_id)
            .map(|c| c.read(|s| s.role == Role::Dispatcher))
            .unwrap_or(false);
        if !is_dispatcher {
            self.misses.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️ Dropping message for {}: not a live dispatcher", dispatcher_id);
            return false;
        }
        self.deliver(message, dispatcher_id, false)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub(crate) fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn deliver(&self, message: ServerMessage, target: ConnectionId, immediate: bool) -> bool {
        if !self.registry.contains(target) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️ Routing miss: connection {} is gone", target);
            return false;
        }

        let outbound = Outbound {
            target,
            message,
            immediate,
        };
        match self.sender.send(outbound) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                trace!("Outbound channel closed, dropping message for {}", target);
                false
            }
        }
    }
}
