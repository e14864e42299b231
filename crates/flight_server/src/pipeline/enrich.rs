//! Fills in recipient-relative fields before serialization.

use super::priority;
use crate::connection::ConnectionRegistry;
use crate::error::StageError;
use crate::messaging::{Outbound, ServerMessage};
use crate::utils::current_timestamp_ms;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// Stamps traffic with the distance from the recipient and the server time.
pub struct EnrichWorker {
    status: Arc<WorkerStatus>,
    registry: Arc<ConnectionRegistry>,
    input: Mutex<mpsc::UnboundedReceiver<Outbound>>,
    output: mpsc::Sender<Outbound>,
}

impl EnrichWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        input: mpsc::UnboundedReceiver<Outbound>,
        output: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            status: Arc::new(WorkerStatus::new("enrich", priority::ENRICH)),
            registry,
            input: Mutex::new(input),
            output,
        }
    }

    /// Returns `None` when the recipient has already gone.
    pub fn enrich(&self, mut outbound: Outbound) -> Option<Outbound> {
        let recipient = self.registry.get(outbound.target)?;

        match &mut outbound.message {
            ServerMessage::Traffic {
                position,
                distance_nm,
                server_time_ms,
                ..
            } => {
                if let Some(here) = recipient.read(|state| state.location()) {
                    *distance_nm = Some(here.distance_nm(&position.location));
                }
                *server_time_ms = current_timestamp_ms();
            }
            ServerMessage::Pong { server_time_ms, .. } if *server_time_ms == 0 => {
                *server_time_ms = current_timestamp_ms();
            }
            _ => {}
        }
        Some(outbound)
    }
}

#[async_trait]
impl Worker for EnrichWorker {
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
        let outbound = input.recv().await.ok_or(StageError::QueueClosed("router"))?;

        let _running = self.status.execute(format!("enriching for {}", outbound.target));
        let target = outbound.target;
        match self.enrich(outbound) {
            Some(outbound) => self
                .output
                .send(outbound)
                .await
                .map_err(|_| StageError::QueueClosed("serialize")),
            None => {
                trace!("Dropping message for departed connection {}", target);
                Ok(())
            }
        }
    }

    async fn close(&self) {
        self.input.lock().await.close();
        self.status.mark_shutdown();
    }
}
