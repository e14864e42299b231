//! The staged processing pipeline.
//!
//! ```text
//! accept ──► read ──► decode ──► logic ══► enrich ──► serialize ──► bandwidth ──► write
//!   │                             ▲  │                                              ▲ │
//!   └──────────── writer halves ──┼──┼──────────────────────────────────────────────┘ │
//!                    idle sweep ──┘  └── closes ────────────────────────────────────────┘
//! ```
//!
//! Every arrow is a bounded `tokio::sync::mpsc` queue except `══►`, the
//! router's outbound channel, which is unbounded so pool threads never wait
//! on the async side. Each stage is a [`Worker`] that owns its inbound
//! queue; the [`Supervisor`](crate::supervisor::Supervisor) runs and heals
//! them.

use crate::auth::Authenticator;
use crate::connection::ConnectionId;
use crate::context::ServerContext;
use crate::messaging::{Codec, Envelope};
use crate::pool::QueueingPool;
use crate::router::Router;
use crate::store::Store;
use crate::worker::Worker;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

pub mod accept;
pub mod bandwidth;
pub mod decode;
pub mod enrich;
pub mod idle;
pub mod logic;
pub mod read;
pub mod serialize;
pub mod write;


pub use accept::AcceptWorker;
pub use bandwidth::{BandwidthMeter, BandwidthStats, BandwidthWorker};
pub use decode::{DecodeStats, DecodeWorker};
pub use enrich::EnrichWorker;
pub use idle::IdleSweepWorker;
pub use logic::LogicWorker;
pub use read::ReadWorker;
pub use serialize::SerializeWorker;
pub use write::WriteWorker;

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    FrameTooLarge,
    IdleTimeout,
    WriteError,
    Kicked,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadError => "read error",
            CloseReason::FrameTooLarge => "frame too large",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::WriteError => "write error",
            CloseReason::Kicked => "kicked",
        };
        f.write_str(text)
    }
}

/// Output of the read stage.
#[derive(Debug)]
pub enum ReadEvent {
    Frame {
        connection_id: ConnectionId,
        bytes: Vec<u8>,
        received_at: Instant,
    },
    Closed {
        connection_id: ConnectionId,
        reason: CloseReason,
    },
}

/// Input of the logic stage.
#[derive(Debug)]
pub enum Inbound {
    Message(Envelope),
    Closed {
        connection_id: ConnectionId,
        reason: CloseReason,
    },
}

impl Inbound {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Inbound::Message(envelope) => envelope.sender,
            Inbound::Closed { connection_id, .. } => *connection_id,
        }
    }
}

/// A serialized, possibly compressed, message body for one connection.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub target: ConnectionId,
    pub bytes: Vec<u8>,
    pub immediate: bool,
}

/// Reading side of a freshly accepted socket.
#[derive(Debug)]
pub struct NewReader {
    pub connection_id: ConnectionId,
    pub half: OwnedReadHalf,
}

/// Writing side of a freshly accepted socket.
#[derive(Debug)]
pub struct NewWriter {
    pub connection_id: ConnectionId,
    pub half: OwnedWriteHalf,
}

/// Length of the big-endian frame length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Sort keys for stage listings, in pipeline order.
pub(crate) mod priority {
    pub const ACCEPT: u32 = 0;
    pub const READ: u32 = 1;
    pub const DECODE: u32 = 2;
    pub const LOGIC: u32 = 3;
    pub const ENRICH: u32 = 4;
    pub const SERIALIZE: u32 = 5;
    pub const BANDWIDTH: u32 = 6;
    pub const WRITE: u32 = 7;
    pub const IDLE: u32 = 8;
}

/// All stages of one server, wired together.
pub struct Pipeline {
    accept: Arc<AcceptWorker>,
    decode: Arc<DecodeWorker>,
    bandwidth: Arc<BandwidthWorker>,
    router: Arc<Router>,
    pool: QueueingPool,
    inbound: mpsc::Sender<Inbound>,
    workers: Vec<Arc<dyn Worker>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.workers.iter().map(|w| w.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

impl Pipeline {
    /// Creates every stage and the queues between them.
    pub fn build(
        ctx: &ServerContext,
        codec: Arc<dyn Codec>,
        store: Arc<dyn Store>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let depth = ctx.config.pipeline.queue_depth.max(1);

        let (reader_tx, reader_rx) = mpsc::channel(depth);
        let (writer_tx, writer_rx) = mpsc::channel(depth);
        let (read_tx, read_rx) = mpsc::channel(depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (enriched_tx, enriched_rx) = mpsc::channel(depth);
        let (encoded_tx, encoded_rx) = mpsc::channel(depth);
        let (metered_tx, metered_rx) = mpsc::channel(depth);
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        let pool = QueueingPool::new(ctx.config.pool.clone());
        let router = Arc::new(Router::new(
            ctx.registry.clone(),
            outbound_tx,
            store,
            auth,
            ctx.config.router.clone(),
        ));

        let accept = Arc::new(AcceptWorker::new(ctx.clone(), reader_tx, writer_tx));
        let read = Arc::new(ReadWorker::new(
            ctx.registry.clone(),
            reader_rx,
            read_tx,
            ctx.config.pipeline.max_frame_size,
        ));
        let decode = Arc::new(DecodeWorker::new(
            ctx.registry.clone(),
            codec.clone(),
            read_rx,
            inbound_tx.clone(),
            ctx.config.pipeline.max_frame_size,
        ));
        let logic = Arc::new(LogicWorker::new(
            ctx.clone(),
            pool.clone(),
            router.clone(),
            inbound_rx,
            close_tx,
        ));
        let enrich = Arc::new(EnrichWorker::new(ctx.registry.clone(), outbound_rx, enriched_tx));
        let serialize = Arc::new(SerializeWorker::new(
            ctx.registry.clone(),
            codec,
            enriched_rx,
            encoded_tx,
        ));
        let bandwidth = Arc::new(BandwidthWorker::new(ctx.registry.clone(), encoded_rx, metered_tx));
        let write = Arc::new(WriteWorker::new(
            ctx.registry.clone(),
            writer_rx,
            metered_rx,
            close_rx,
            inbound_tx.clone(),
            ctx.config.pipeline.batch_interval(),
            ctx.config.pipeline.write_timeout(),
        ));
        let idle = Arc::new(IdleSweepWorker::new(
            ctx.registry.clone(),
            inbound_tx.clone(),
            ctx.config.connection_timeout(),
            ctx.config.pipeline.idle_sweep_interval(),
        ));

        let workers: Vec<Arc<dyn Worker>> = vec![
            accept.clone(),
            read,
            decode.clone(),
            logic,
            enrich,
            serialize,
            bandwidth.clone(),
            write,
            idle,
        ];

        Self {
            accept,
            decode,
            bandwidth,
            router,
            pool,
            inbound: inbound_tx,
            workers,
        }
    }

    /// The stages in pipeline order, ready to hand to a supervisor.
    pub fn workers(&self) -> Vec<Arc<dyn Worker>> {
        self.workers.clone()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn pool(&self) -> &QueueingPool {
        &self.pool
    }

    /// Address the accept stage is listening on, once opened.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.accept.local_addr()
    }

    pub fn bandwidth(&self) -> BandwidthStats {
        self.bandwidth.stats()
    }

    pub fn decode_stats(&self) -> DecodeStats {
        self.decode.stats()
    }

    /// Asks the logic stage to close a connection. Returns false if the
    /// connection is unknown or the stage is not accepting input.
    pub fn kick(&self, connection_id: ConnectionId) -> bool {
        if !self.router.registry().contains(connection_id) {
            return false;
        }
        self.inbound
            .try_send(Inbound::Closed {
                connection_id,
                reason: CloseReason::Kicked,
            })
            .is_ok()
    }
}
