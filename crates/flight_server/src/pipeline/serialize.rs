//! Encodes outbound messages with each recipient's protocol settings.

use super::{priority, EncodedFrame};
use crate::connection::ConnectionRegistry;
use crate::error::StageError;
use crate::messaging::compression::compress;
use crate::messaging::{Codec, Outbound};
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

/// Turns router output into compressed frames.
pub struct SerializeWorker {
    status: Arc<WorkerStatus>,
    registry: Arc<ConnectionRegistry>,
    codec: Arc<dyn Codec>,
    input: Mutex<mpsc::Receiver<Outbound>>,
    output: mpsc::Sender<EncodedFrame>,
}

impl SerializeWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        codec: Arc<dyn Codec>,
        input: mpsc::Receiver<Outbound>,
        output: mpsc::Sender<EncodedFrame>,
    ) -> Self {
        Self {
            status: Arc::new(WorkerStatus::new("serialize", priority::SERIALIZE)),
            registry,
            codec,
            input: Mutex::new(input),
            output,
        }
    }

    fn serialize(&self, outbound: Outbound) -> Option<EncodedFrame> {
        let Some(connection) = self.registry.get(outbound.target) else {
            trace!("Recipient {} gone before serialization", outbound.target);
            return None;
        };
        let (version, compression) = connection.read(|state| (state.protocol_version, state.compression));

        let body = match self.codec.encode(&outbound.message, version) {
            Ok(body) => body,
            Err(e) => {
                warn!("⚠️ Could not encode message for {}: {}", outbound.target, e);
                return None;
            }
        };
        match compress(compression, &body) {
            Ok(bytes) => Some(EncodedFrame {
                target: outbound.target,
                bytes,
                immediate: outbound.immediate,
            }),
            Err(e) => {
                warn!("⚠️ Could not compress message for {}: {}", outbound.target, e);
                None
            }
        }
    }
}

#[async_trait]
impl Worker for SerializeWorker {
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
        let outbound = input.recv().await.ok_or(StageError::QueueClosed("enrich"))?;

        let _running = self.status.execute(format!("serializing for {}", outbound.target));
        if let Some(frame) = self.serialize(outbound) {
            self.output
                .send(frame)
                .await
                .map_err(|_| StageError::QueueClosed("bandwidth"))?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.input.lock().await.close();
        self.status.mark_shutdown();
    }
}
