//! Socket read stage.
//!
//! Every accepted connection contributes one frame stream; the stage polls
//! them all from a single task through [`SelectAll`]. A stream ends when the
//! peer closes, on a read error, on an oversized frame, or when the
//! connection is removed from the registry.

use super::{priority, CloseReason, NewReader, ReadEvent, FRAME_HEADER_LEN};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::error::StageError;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before a header.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>, CloseReason>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            debug!("Read failed: {}", e);
            return Err(CloseReason::ReadError);
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(CloseReason::FrameTooLarge);
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        debug!("Read failed mid-frame: {}", e);
        CloseReason::ReadError
    })?;
    Ok(Some(body))
}

struct FrameSource<R> {
    reader: BufReader<R>,
    connection_id: ConnectionId,
    max_frame_size: usize,
    done: bool,
}

/// Turns a socket half into a stream of read events ending with one `Closed`.
///
/// `until` resolves when the connection is torn down elsewhere; the stream
/// then ends without reporting a close of its own.
pub fn frame_stream<R, F>(
    connection_id: ConnectionId,
    half: R,
    max_frame_size: usize,
    until: F,
) -> BoxStream<'static, ReadEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let source = FrameSource {
        reader: BufReader::new(half),
        connection_id,
        max_frame_size,
        done: false,
    };

    stream::unfold(source, |mut source| async move {
        if source.done {
            return None;
        }
        let event = match read_frame(&mut source.reader, source.max_frame_size).await {
            Ok(Some(bytes)) => ReadEvent::Frame {
                connection_id: source.connection_id,
                bytes,
                received_at: Instant::now(),
            },
            Ok(None) => {
                source.done = true;
                ReadEvent::Closed {
                    connection_id: source.connection_id,
                    reason: CloseReason::PeerClosed,
                }
            }
            Err(reason) => {
                source.done = true;
                ReadEvent::Closed {
                    connection_id: source.connection_id,
                    reason,
                }
            }
        };
        Some((event, source))
    })
    .take_until(until)
    .boxed()
}

struct ReadState {
    readers: mpsc::Receiver<NewReader>,
    streams: SelectAll<BoxStream<'static, ReadEvent>>,
}

/// Multiplexes every connection's read half into the decode queue.
pub struct ReadWorker {
    status: Arc<WorkerStatus>,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<ReadState>,
    output: mpsc::Sender<ReadEvent>,
    max_frame_size: usize,
}

impl ReadWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        readers: mpsc::Receiver<NewReader>,
        output: mpsc::Sender<ReadEvent>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            status: Arc::new(WorkerStatus::new("read", priority::READ)),
            registry,
            state: Mutex::new(ReadState {
                readers,
                streams: SelectAll::new(),
            }),
            output,
            max_frame_size,
        }
    }

    fn attach(&self, state: &mut ReadState, reader: NewReader) {
        let NewReader { connection_id, half } = reader;
        // Removed before its reader arrived; dropping the half is enough.
        let Some(connection) = self.registry.get(connection_id) else {
            debug!("Connection {} gone before reading started", connection_id);
            return;
        };
        let stream = frame_stream(connection_id, half, self.max_frame_size, connection.closed());
        state.streams.push(stream);
        trace!("Reading from connection {} ({} streams)", connection_id, state.streams.len());
    }
}

#[async_trait]
impl Worker for ReadWorker {
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
            reader = state.readers.recv() => {
                let reader = reader.ok_or(StageError::QueueClosed("readers"))?;
                let _running = self.status.execute(format!("attaching {}", reader.connection_id));
                self.attach(state, reader);
                return Ok(());
            }
            event = state.streams.next(), if !state.streams.is_empty() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        let _running = self.status.execute("forwarding frame");
        self.output
            .send(event)
            .await
            .map_err(|_| StageError::QueueClosed("decode"))
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.readers.close();
        state.streams = SelectAll::new();
        self.status.mark_shutdown();
    }
}
