//! Core flight server implementation.
//!
//! This module contains the main `FlightServer` struct, which wires the
//! staged pipeline to a supervisor and exposes the handles operators and
//! the binary need: lifecycle, metrics and connection management.

use crate::{
    auth::{Authenticator, TrustingAuthenticator},
    config::ServerConfig,
    connection::{ConnectionId, ConnectionRegistry},
    context::ServerContext,
    error::ServerError,
    health::ServerMetrics,
    messaging::{Codec, JsonCodec},
    pipeline::Pipeline,
    router::Router,
    security::AdmissionControl,
    store::{MemoryStore, Store},
    supervisor::Supervisor,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// The core flight server structure.
///
/// `FlightServer` owns one [`Pipeline`] of stages and the [`Supervisor`]
/// running them.
///
/// # Architecture
///
/// * **Pipeline**: accept → read → decode → logic → enrich → serialize →
///   bandwidth → write, plus an idle sweep
/// * **Router**: dispatch and viewer binding, proximity traffic, sessions
/// * **Registry**: every live connection and its bindings
/// * **Supervisor**: restarts crashed or hung stages, drives shutdown
pub struct FlightServer {
    /// Shared handles passed to every stage
    ctx: ServerContext,

    /// The stage chain
    pipeline: Pipeline,

    /// Runs and heals the stages
    supervisor: Supervisor,

    /// Construction time, for uptime reporting
    created_at: Instant,

    running: AtomicBool,
}

impl std::fmt::Debug for FlightServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightServer")
            .field("bind_address", &self.ctx.config.bind_address)
            .field("running", &self.is_running())
            .finish()
    }
}

impl FlightServer {
    /// Creates a new flight server with the reference collaborators.
    ///
    /// Uses [`JsonCodec`] on the wire, an in-memory [`MemoryStore`] and the
    /// [`TrustingAuthenticator`]. The server is ready to start after
    /// construction.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration parameters for server behavior
    pub fn new(config: ServerConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(JsonCodec),
            Arc::new(MemoryStore::new()),
            Arc::new(TrustingAuthenticator),
        )
    }

    /// Creates a new flight server with custom codec, store and authenticator.
    pub fn with_collaborators(
        config: ServerConfig,
        codec: Arc<dyn Codec>,
        store: Arc<dyn Store>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let ctx = ServerContext::new(config);
        let pipeline = Pipeline::build(&ctx, codec, store, auth);
        let supervisor = Supervisor::new(
            pipeline.workers(),
            ctx.registry.clone(),
            ctx.config.supervisor.clone(),
        );

        Self {
            ctx,
            pipeline,
            supervisor,
            created_at: Instant::now(),
            running: AtomicBool::new(false),
        }
    }

    /// Opens every stage and starts serving.
    ///
    /// Returns once the listener is bound and all stage tasks are running;
    /// call [`FlightServer::stop`] to shut down.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::StageOpen`] if a stage fails to open, e.g.
    /// because the bind address is in use.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::Internal(String::from("server already started")));
        }
        info!("🚀 Starting flight server on {}", self.ctx.config.bind_address);

        if let Err(e) = self.supervisor.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if let Some(addr) = self.local_addr() {
            info!("✅ Flight server ready on {}", addr);
        }
        Ok(())
    }

    /// Stops every stage in order and drops all connections.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("⚠️ Stop requested but the server is not running");
            return;
        }
        info!("🛑 Shutting down flight server...");
        self.supervisor.stop().await;
        info!("✅ Flight server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.pipeline.local_addr()
    }

    pub fn get_registry(&self) -> Arc<ConnectionRegistry> {
        self.ctx.registry.clone()
    }

    pub fn get_router(&self) -> Arc<Router> {
        self.pipeline.router().clone()
    }

    pub fn get_supervisor(&self) -> Supervisor {
        self.supervisor.clone()
    }

    pub fn get_admission(&self) -> Arc<AdmissionControl> {
        self.ctx.admission.clone()
    }

    /// Closes a connection through the logic stage, notifying its counterparts.
    pub fn kick(&self, connection_id: ConnectionId) -> bool {
        let kicked = self.pipeline.kick(connection_id);
        if kicked {
            info!("👢 Kicking connection {}", connection_id);
        }
        kicked
    }

    /// Collects a metrics snapshot from every component.
    pub fn metrics(&self) -> ServerMetrics {
        ServerMetrics {
            uptime_seconds: self.created_at.elapsed().as_secs(),
            max_connections: self.ctx.config.max_connections,
            connections: self.ctx.registry.role_counts(),
            stages: self.supervisor.stages(),
            stage_restarts: self.supervisor.restarts(),
            pool: self.pipeline.pool().stats(),
            router: self.pipeline.router().stats(),
            bandwidth: self.pipeline.bandwidth(),
            decode: self.pipeline.decode_stats(),
            security: self.ctx.admission.stats(),
        }
    }
}
