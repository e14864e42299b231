//! The unit contract for one pipeline stage.
//!
//! A stage is a value implementing [`Worker`]. It is opened once, stepped
//! repeatedly inside [`run_supervised`], and closed on shutdown. All state a
//! stage needs across restarts (queue endpoints, socket maps, buffers) lives
//! in the worker value itself, never in the task that happens to be running
//! it, so the supervisor can throw a task away and start a new one on the
//! same instance.

use crate::error::StageError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

pub mod status;

pub use status::{ExecutionGuard, ExecutionState, LatencyRing, StatusSnapshot, WorkerStatus};

/// One stage of the processing pipeline.
///
/// Implementations use interior mutability: every method takes `&self`
/// because the same instance is shared between the supervisor, the task
/// running it and any replacement task after a restart.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable stage name used for logging and supervision.
    fn name(&self) -> &str;

    /// The execution record of this stage.
    fn status(&self) -> Arc<WorkerStatus>;

    /// Acquires the resources the stage needs. Called once before the first step.
    async fn open(&self) -> Result<(), StageError>;

    /// Performs one unit of work, blocking on the inbound queue or socket
    /// readiness until there is something to do.
    async fn step(&self) -> Result<(), StageError>;

    /// Releases resources. Called once during shutdown.
    async fn close(&self);
}

/// Runs a worker until interrupted or until a step fails.
///
/// The interrupt is checked between steps and also races every step, so a
/// stage blocked on an empty queue still exits promptly when shutdown flips
/// the flag.
pub async fn run_supervised(
    worker: Arc<dyn Worker>,
    mut interrupt: watch::Receiver<bool>,
) -> Result<(), StageError> {
    loop {
        if *interrupt.borrow() {
            return Ok(());
        }

        tokio::select! {
            biased;
            changed = interrupt.changed() => {
                if changed.is_err() || *interrupt.borrow() {
                    return Ok(());
                }
            }
            result = worker.step() => result?,
        }
    }
}
