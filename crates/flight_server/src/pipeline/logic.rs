//! Logic stage: hands decoded messages to the router on the queueing pool.
//!
//! Messages from different connections run in parallel on pool threads.
//! Messages from the same connection are serialized through a per-connection
//! lane: at most one pool task drains a lane at a time, one item per task,
//! resubmitting itself while the lane is non-empty.

use super::{priority, Inbound};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::context::ServerContext;
use crate::error::StageError;
use crate::pool::QueueingPool;
use crate::router::Router;
use crate::security::AdmissionControl;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

#[derive(Default)]
struct Lane {
    queue: VecDeque<Inbound>,
    running: bool,
}

struct LaneContext {
    lanes: Mutex<HashMap<ConnectionId, Lane>>,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<AdmissionControl>,
    closer: mpsc::UnboundedSender<ConnectionId>,
    pool: QueueingPool,
}

impl LaneContext {
    /// Queues an item on its connection's lane, starting a drain task if idle.
    fn enqueue(self: &Arc<Self>, item: Inbound) -> Result<(), StageError> {
        let id = item.connection_id();
        let start = {
            let mut lanes = self.lanes.lock();
            let lane = lanes.entry(id).or_default();
            lane.queue.push_back(item);
            !std::mem::replace(&mut lane.running, true)
        };
        if start {
            self.schedule(id)?;
        }
        Ok(())
    }

    fn schedule(self: &Arc<Self>, id: ConnectionId) -> Result<(), StageError> {
        let ctx = self.clone();
        if let Err(e) = self.pool.submit(format!("lane {id}"), move || ctx.run_lane(id)) {
            self.lanes.lock().remove(&id);
            return Err(StageError::Other(e.to_string()));
        }
        Ok(())
    }

    fn run_lane(self: Arc<Self>, id: ConnectionId) {
        let item = self.lanes.lock().get_mut(&id).and_then(|lane| lane.queue.pop_front());
        if let Some(item) = item {
            self.process(item);
        }

        let more = {
            let mut lanes = self.lanes.lock();
            match lanes.get(&id) {
                Some(lane) if !lane.queue.is_empty() => true,
                _ => {
                    lanes.remove(&id);
                    false
                }
            }
        };
        if more {
            if let Err(e) = self.schedule(id) {
                warn!("⚠️ Dropping queued work for connection {}: {}", id, e);
            }
        }
    }

    fn process(&self, item: Inbound) {
        match item {
            Inbound::Message(envelope) => self.router.handle(&envelope),
            Inbound::Closed { connection_id, reason } => {
                if let Some(removal) = self.registry.remove(connection_id) {
                    debug!("Closing connection {}: {}", connection_id, reason);
                    self.router.on_disconnect(&removal);
                    if let Some(addr) = removal.snapshot.remote_addr {
                        self.admission.release(addr.ip());
                    }
                }
                // The write stage drops the socket even if the registry entry was already gone.
                let _ = self.closer.send(connection_id);
            }
        }
    }
}

/// Feeds the router from the decode stage, keeping per-connection order.
pub struct LogicWorker {
    status: Arc<WorkerStatus>,
    lanes: Arc<LaneContext>,
    input: AsyncMutex<mpsc::Receiver<Inbound>>,
}

impl LogicWorker {
    pub fn new(
        ctx: ServerContext,
        pool: QueueingPool,
        router: Arc<Router>,
        input: mpsc::Receiver<Inbound>,
        closer: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            status: Arc::new(WorkerStatus::new("logic", priority::LOGIC)),
            lanes: Arc::new(LaneContext {
                lanes: Mutex::new(HashMap::new()),
                router,
                registry: ctx.registry,
                admission: ctx.admission,
                closer,
                pool,
            }),
            input: AsyncMutex::new(input),
        }
    }

    /// Connections with queued or running work.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lanes.lock().len()
    }
}

#[async_trait]
impl Worker for LogicWorker {
    fn name(&self) -> &str {
        self.status.name()
    }

    fn status(&self) -> Arc<WorkerStatus> {
        self.status.clone()
    }

    async fn open(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn step(&self) -> Result<(), StageError> {
        let mut input = self.input.lock().await;
        let item = input.recv().await.ok_or(StageError::QueueClosed("decode"))?;

        let _running = self
            .status
            .execute(format!("submitting work for {}", item.connection_id()));
        self.lanes.enqueue(item)
    }

    async fn close(&self) {
        self.input.lock().await.close();
        let pool = self.lanes.pool.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown()).await {
            error!("❌ Pool shutdown task failed: {}", e);
        }
        self.status.mark_shutdown();
    }
}
