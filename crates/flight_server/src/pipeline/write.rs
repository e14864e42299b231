//! Socket write stage with per-connection batching.
//!
//! Frames are appended to their connection's buffer with a length prefix.
//! Immediate frames flush the buffer at once; everything else waits for the
//! next batch tick. A failed or timed out write drops the socket and reports
//! the connection closed to the logic stage.

use super::{priority, CloseReason, EncodedFrame, Inbound, NewWriter};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::error::StageError;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

/// Appends one length-prefixed frame to `buffer`.
pub fn append_frame(buffer: &mut Vec<u8>, body: &[u8]) {
    buffer.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buffer.extend_from_slice(body);
}

struct Socket {
    half: OwnedWriteHalf,
    buffer: Vec<u8>,
}

struct WriteState {
    writers: mpsc::Receiver<NewWriter>,
    frames: mpsc::Receiver<EncodedFrame>,
    closes: mpsc::UnboundedReceiver<ConnectionId>,
    sockets: HashMap<ConnectionId, Socket>,
    next_flush: Instant,
}

enum Event {
    Close(ConnectionId),
    Writer(NewWriter),
    Frame(EncodedFrame),
    Tick,
}

/// Owns every socket's write half.
pub struct WriteWorker {
    status: Arc<WorkerStatus>,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<WriteState>,
    failures: mpsc::Sender<Inbound>,
    batch_interval: Duration,
    write_timeout: Duration,
}

impl WriteWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        writers: mpsc::Receiver<NewWriter>,
        frames: mpsc::Receiver<EncodedFrame>,
        closes: mpsc::UnboundedReceiver<ConnectionId>,
        failures: mpsc::Sender<Inbound>,
        batch_interval: Duration,
        write_timeout: Duration,
    ) -> Self {
        let batch_interval = batch_interval.max(Duration::from_millis(1));
        Self {
            status: Arc::new(WorkerStatus::new("write", priority::WRITE)),
            registry,
            state: Mutex::new(WriteState {
                writers,
                frames,
                closes,
                sockets: HashMap::new(),
                next_flush: Instant::now() + batch_interval,
            }),
            failures,
            batch_interval,
            write_timeout,
        }
    }

    /// Writes out one socket's buffer. Returns false if the socket is dead.
    async fn flush(&self, id: ConnectionId, socket: &mut Socket) -> bool {
        if socket.buffer.is_empty() {
            return true;
        }
        match timeout(self.write_timeout, socket.half.write_all(&socket.buffer)).await {
            Ok(Ok(())) => {
                socket.buffer.clear();
                true
            }
            Ok(Err(e)) => {
                debug!("Write to connection {} failed: {}", id, e);
                false
            }
            Err(_) => {
                warn!("⏱️ Write to connection {} timed out after {:?}", id, self.write_timeout);
                false
            }
        }
    }

    async fn fail(&self, state: &mut WriteState, ids: Vec<ConnectionId>) -> Result<(), StageError> {
        for id in ids {
            state.sockets.remove(&id);
            self.failures
                .send(Inbound::Closed {
                    connection_id: id,
                    reason: CloseReason::WriteError,
                })
                .await
                .map_err(|_| StageError::QueueClosed("logic"))?;
        }
        Ok(())
    }

    async fn flush_all(&self, state: &mut WriteState) -> Result<(), StageError> {
        let mut dead = Vec::new();
        for (id, socket) in state.sockets.iter_mut() {
            if !self.flush(*id, socket).await {
                dead.push(*id);
            }
        }
        self.fail(state, dead).await
    }
}

#[async_trait]
impl Worker for WriteWorker {
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
        let state = &mut *state;

        let event = tokio::select! {
            biased;
            Some(id) = state.closes.recv() => Event::Close(id),
            writer = state.writers.recv() => Event::Writer(writer.ok_or(StageError::QueueClosed("writers"))?),
            frame = state.frames.recv() => Event::Frame(frame.ok_or(StageError::QueueClosed("bandwidth"))?),
            _ = sleep_until(state.next_flush) => Event::Tick,
        };

        match event {
            Event::Close(id) => {
                if let Some(mut socket) = state.sockets.remove(&id) {
                    let _running = self.status.execute(format!("closing {id}"));
                    // Best effort: whatever is still buffered goes out before the FIN.
                    if self.flush(id, &mut socket).await {
                        let _ = timeout(self.write_timeout, socket.half.shutdown()).await;
                    }
                    trace!("Dropped writer for connection {}", id);
                }
            }
            Event::Writer(NewWriter { connection_id, half }) => {
                if self.registry.contains(connection_id) {
                    state.sockets.insert(
                        connection_id,
                        Socket {
                            half,
                            buffer: Vec::new(),
                        },
                    );
                }
            }
            Event::Frame(frame) => {
                let Some(socket) = state.sockets.get_mut(&frame.target) else {
                    trace!("No writer for connection {}; frame dropped", frame.target);
                    return Ok(());
                };
                append_frame(&mut socket.buffer, &frame.bytes);
                if frame.immediate {
                    let _running = self.status.execute(format!("flushing {}", frame.target));
                    if !self.flush(frame.target, socket).await {
                        self.fail(state, vec![frame.target]).await?;
                    }
                }
            }
            Event::Tick => {
                state.next_flush = Instant::now() + self.batch_interval;
                if state.sockets.values().any(|s| !s.buffer.is_empty()) {
                    let _running = self.status.execute("flushing batch");
                    self.flush_all(state).await?;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.writers.close();
        state.frames.close();
        if let Err(e) = self.flush_all(&mut state).await {
            debug!("Final flush incomplete: {}", e);
        }
        for (_, mut socket) in state.sockets.drain() {
            let _ = timeout(self.write_timeout, socket.half.shutdown()).await;
        }
        self.status.mark_shutdown();
    }
}
