//! Idle timeout sweep.

use super::{priority, CloseReason, Inbound};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::error::StageError;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::info;

struct SweepState {
    next_sweep: Instant,
    /// Connections already reported, so a slow logic stage does not get duplicates
    reported: HashSet<ConnectionId>,
}

/// Periodically reports connections silent for longer than the timeout.
pub struct IdleSweepWorker {
    status: Arc<WorkerStatus>,
    registry: Arc<ConnectionRegistry>,
    output: mpsc::Sender<Inbound>,
    timeout: Duration,
    interval: Duration,
    state: Mutex<SweepState>,
}

impl IdleSweepWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        output: mpsc::Sender<Inbound>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        let interval = interval.max(Duration::from_millis(10));
        Self {
            status: Arc::new(WorkerStatus::new("idle-sweep", priority::IDLE)),
            registry,
            output,
            timeout,
            interval,
            state: Mutex::new(SweepState {
                next_sweep: Instant::now() + interval,
                reported: HashSet::new(),
            }),
        }
    }

    /// Connections idle past the timeout that have not been reported yet.
    fn expired(&self, reported: &mut HashSet<ConnectionId>) -> Vec<ConnectionId> {
        let live: HashSet<ConnectionId> = self.registry.ids().into_iter().collect();
        reported.retain(|id| live.contains(id));

        live.into_iter()
            .filter(|id| !reported.contains(id))
            .filter(|id| {
                self.registry
                    .get(*id)
                    .is_some_and(|c| c.idle_for() > self.timeout)
            })
            .collect()
    }
}

#[async_trait]
impl Worker for IdleSweepWorker {
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
        let mut state = self.state.lock().await;
        sleep_until(state.next_sweep).await;
        state.next_sweep = Instant::now() + self.interval;

        if self.timeout.is_zero() {
            return Ok(());
        }

        let _running = self.status.execute("sweeping idle connections");
        let expired = self.expired(&mut state.reported);
        for id in expired {
            info!("⏰ Connection {} idle for more than {:?}; closing", id, self.timeout);
            self.output
                .send(Inbound::Closed {
                    connection_id: id,
                    reason: CloseReason::IdleTimeout,
                })
                .await
                .map_err(|_| StageError::QueueClosed("logic"))?;
            state.reported.insert(id);
        }
        Ok(())
    }

    async fn close(&self) {
        self.status.mark_shutdown();
    }
}
