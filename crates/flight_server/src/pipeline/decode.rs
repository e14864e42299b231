//! Frame decode stage.

use super::{priority, Inbound, ReadEvent};
use crate::connection::ConnectionRegistry;
use crate::error::StageError;
use crate::messaging::compression::decompress;
use crate::messaging::{Codec, Envelope};
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

/// Decode counters for metrics export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeStats {
    pub decoded: u64,
    pub malformed: u64,
    pub orphaned: u64,
}

/// Decompresses and decodes frames, stamping each message with its sender.
pub struct DecodeWorker {
    status: Arc<WorkerStatus>,
    registry: Arc<ConnectionRegistry>,
    codec: Arc<dyn Codec>,
    input: Mutex<mpsc::Receiver<ReadEvent>>,
    output: mpsc::Sender<Inbound>,
    max_frame_size: usize,
    decoded: AtomicU64,
    malformed: AtomicU64,
    orphaned: AtomicU64,
}

impl DecodeWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        codec: Arc<dyn Codec>,
        input: mpsc::Receiver<ReadEvent>,
        output: mpsc::Sender<Inbound>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            status: Arc::new(WorkerStatus::new("decode", priority::DECODE)),
            registry,
            codec,
            input: Mutex::new(input),
            output,
            max_frame_size,
            decoded: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            orphaned: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            decoded: self.decoded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }

    /// Turns one read event into logic-stage input, or `None` if it is dropped.
    pub(crate) fn decode(&self, event: ReadEvent) -> Option<Inbound> {
        let (connection_id, bytes) = match event {
            ReadEvent::Closed { connection_id, reason } => {
                return Some(Inbound::Closed { connection_id, reason });
            }
            ReadEvent::Frame { connection_id, bytes, .. } => (connection_id, bytes),
        };

        let Some(connection) = self.registry.get(connection_id) else {
            self.orphaned.fetch_add(1, Ordering::Relaxed);
            trace!("Dropping frame from departed connection {}", connection_id);
            return None;
        };
        connection.counters().record_in(bytes.len() + super::FRAME_HEADER_LEN);
        connection.touch();

        let (compression, owner) = connection.read(|state| (state.compression, state.user_id()));
        let frame = match decompress(compression, &bytes, self.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️ Undecompressable frame from {}: {}", connection_id, e);
                return None;
            }
        };

        match self.codec.decode(&frame) {
            Ok(message) => {
                self.decoded.fetch_add(1, Ordering::Relaxed);
                Some(Inbound::Message(Envelope::new(message, connection_id, owner)))
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️ Malformed frame from {}: {}", connection_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl Worker for DecodeWorker {
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
        let event = input.recv().await.ok_or(StageError::QueueClosed("read"))?;

        let _running = self.status.execute("decoding frame");
        if let Some(inbound) = self.decode(event) {
            self.output
                .send(inbound)
                .await
                .map_err(|_| StageError::QueueClosed("logic"))?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.input.lock().await.close();
        self.status.mark_shutdown();
    }
}
