//! Connection-accept stage.

use super::{priority, NewReader, NewWriter};
use crate::connection::{Connection, ConnectionState};
use crate::context::ServerContext;
use crate::error::StageError;
use crate::security::SecurityError;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Binds the listener and turns accepted sockets into registered connections.
pub struct AcceptWorker {
    ctx: ServerContext,
    status: Arc<WorkerStatus>,
    listener: AsyncMutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    readers: mpsc::Sender<NewReader>,
    writers: mpsc::Sender<NewWriter>,
}

impl AcceptWorker {
    pub fn new(ctx: ServerContext, readers: mpsc::Sender<NewReader>, writers: mpsc::Sender<NewWriter>) -> Self {
        Self {
            ctx,
            status: Arc::new(WorkerStatus::new("accept", priority::ACCEPT)),
            listener: AsyncMutex::new(None),
            local_addr: Mutex::new(None),
            readers,
            writers,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn admit(&self, addr: SocketAddr) -> Result<(), SecurityError> {
        let max = self.ctx.config.max_connections;
        if max > 0 && self.ctx.registry.len() >= max {
            return Err(SecurityError::ServerFull(max));
        }
        self.ctx.admission.admit(addr.ip())
    }

    /// Registers an admitted socket and hands its halves to the I/O stages.
    ///
    /// On failure the registry entry and the admission slot are released again.
    pub(super) async fn register(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), StageError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let router = &self.ctx.config.router;
        let state = ConnectionState::new(
            router.default_range_nm,
            router.default_max_aircraft,
            router.default_dispatch_range_nm,
        );
        let id = self.ctx.registry.allocate_id();
        if let Err(e) = self.ctx.registry.add(Connection::new(id, Some(addr), state)) {
            self.ctx.admission.release(addr.ip());
            return Err(StageError::Other(e.to_string()));
        }

        let (read_half, write_half) = stream.into_split();
        let handed_off = match self
            .writers
            .send(NewWriter {
                connection_id: id,
                half: write_half,
            })
            .await
        {
            Ok(()) => self
                .readers
                .send(NewReader {
                    connection_id: id,
                    half: read_half,
                })
                .await
                .map_err(|_| StageError::QueueClosed("readers")),
            Err(_) => Err(StageError::QueueClosed("writers")),
        };
        if let Err(e) = handed_off {
            // Nothing downstream owns the connection; undo the registration.
            self.ctx.registry.remove(id);
            self.ctx.admission.release(addr.ip());
            warn!("⚠️ Dropped connection {} from {}: {}", id, addr, e);
            return Err(e);
        }

        info!("🔗 New connection {} from {}", id, addr);
        Ok(())
    }
}

#[async_trait]
impl Worker for AcceptWorker {
    fn name(&self) -> &str {
        self.status.name()
    }

    fn status(&self) -> Arc<WorkerStatus> {
        self.status.clone()
    }

    async fn open(&self) -> Result<(), StageError> {
        let bind = self.ctx.config.bind_address;
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        *self.listener.lock().await = Some(listener);
        info!("🌐 Listening on {}", addr);
        Ok(())
    }

    async fn step(&self) -> Result<(), StageError> {
        let listener = self.listener.lock().await;
        let listener = listener.as_ref().ok_or(StageError::NotOpen)?;

        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Per-socket failures (e.g. the peer reset before accept) are not fatal.
                warn!("⚠️ Accept failed: {}", e);
                return Ok(());
            }
        };

        let _running = self.status.execute(format!("accepting {addr}"));
        if let Err(e) = self.admit(addr) {
            warn!("🚫 Refused connection from {}: {}", addr, e);
            return Ok(());
        }
        self.register(stream, addr).await
    }

    async fn close(&self) {
        if self.listener.lock().await.take().is_some() {
            info!("🛑 Stopped accepting connections");
        }
    }
}
