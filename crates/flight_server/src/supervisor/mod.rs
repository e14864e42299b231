//! Stage supervision: start, self-heal and ordered shutdown.
//!
//! Every stage runs in its own task inside [`run_supervised`]. The
//! supervisor keeps one slot per stage in a single table guarded by one
//! mutex. A slot is replaced (its generation bumped) whenever the stage is
//! restarted; the replacement runs the **same** worker instance, so queue
//! endpoints and buffers held by the worker survive the restart.
//!
//! Two paths restart a stage:
//!
//! - the exit watcher spawned next to each task notices the task ended
//!   (error, panic or abort) and restarts it at once;
//! - the periodic sweep restarts any stage whose task is gone and aborts and
//!   restarts any stage whose current unit of work has run past the hang
//!   threshold.
//!
//! Both paths name the generation they observed, so a stage is restarted at
//! most once per failure.

use crate::config::SupervisorConfig;
use crate::connection::ConnectionRegistry;
use crate::error::{ServerError, StageError};
use crate::worker::{run_supervised, StatusSnapshot, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};


/// How a stage task ended.
#[derive(Debug)]
enum Exit {
    Interrupted,
    Failed(StageError),
    Panicked(String),
    Aborted,
}

impl Exit {
    fn from_join(result: Result<Result<(), StageError>, JoinError>) -> Self {
        match result {
            Ok(Ok(())) => Exit::Interrupted,
            Ok(Err(e)) => Exit::Failed(e),
            Err(e) if e.is_cancelled() => Exit::Aborted,
            Err(e) => Exit::Panicked(panic_message(e)),
        }
    }
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| String::from("unknown panic")),
        Err(e) => e.to_string(),
    }
}

struct Slot {
    worker: Arc<dyn Worker>,
    generation: u64,
    abort: AbortHandle,
    /// Flips to true once this generation's task has ended
    exited: watch::Receiver<bool>,
    watcher: Option<JoinHandle<()>>,
    restarts: u64,
}

impl Slot {
    fn finished(&self) -> bool {
        *self.exited.borrow()
    }
}

/// Supervision view of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub generation: u64,
    pub restarts: u64,
    pub alive: bool,
    pub status: StatusSnapshot,
}

struct SupervisorInner {
    config: SupervisorConfig,
    registry: Arc<ConnectionRegistry>,
    workers: Vec<Arc<dyn Worker>>,
    slots: Mutex<HashMap<String, Slot>>,
    interrupt: watch::Sender<bool>,
    shutting_down: AtomicBool,
    runtime: Mutex<Option<Handle>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    restarts: AtomicU64,
}

/// Owns the stage tasks. Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("stages", &self.inner.workers.len())
            .field("restarts", &self.inner.restarts.load(Ordering::Relaxed))
            .finish()
    }
}

impl Supervisor {
    pub fn new(workers: Vec<Arc<dyn Worker>>, registry: Arc<ConnectionRegistry>, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                registry,
                workers,
                slots: Mutex::new(HashMap::new()),
                interrupt: watch::channel(false).0,
                shutting_down: AtomicBool::new(false),
                runtime: Mutex::new(None),
                sweep: Mutex::new(None),
                restarts: AtomicU64::new(0),
            }),
        }
    }

    /// Opens every stage in order, then spawns one task per stage and the sweep.
    ///
    /// A stage that fails to open aborts startup; stages opened before it
    /// are closed again.
    pub async fn start(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        let runtime = Handle::try_current().map_err(|e| ServerError::Internal(e.to_string()))?;
        *inner.runtime.lock() = Some(runtime);

        for (index, worker) in inner.workers.iter().enumerate() {
            if let Err(source) = worker.open().await {
                error!("❌ Stage '{}' failed to open: {}", worker.name(), source);
                for opened in inner.workers[..index].iter().rev() {
                    opened.close().await;
                }
                return Err(ServerError::StageOpen {
                    stage: worker.name().to_string(),
                    source,
                });
            }
        }

        {
            let mut slots = inner.slots.lock();
            for worker in &inner.workers {
                worker.status().mark_idle();
                let slot = inner.spawn(worker.clone(), 0, 0);
                slots.insert(worker.name().to_string(), slot);
            }
        }

        let sweeper = inner.clone();
        let sweep = tokio::spawn(async move { sweeper.sweep_loop().await });
        *inner.sweep.lock() = Some(sweep);

        info!("🚀 Supervisor started {} stage(s)", inner.workers.len());
        Ok(())
    }

    /// Kills one stage's task out of band; the exit watcher or the sweep restarts it.
    pub fn abort_stage(&self, name: &str) -> bool {
        match self.inner.slots.lock().get(name) {
            Some(slot) => {
                warn!("🔪 Aborting stage '{}' (generation {})", name, slot.generation);
                slot.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Runs one health sweep immediately.
    pub async fn sweep_now(&self) {
        self.inner.sweep_once().await;
    }

    /// Interrupts every stage, waits for voluntary exit, closes the workers and
    /// aborts anything still running.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Stopping {} stage(s)", inner.workers.len());

        if let Some(sweep) = inner.sweep.lock().take() {
            sweep.abort();
        }
        inner.interrupt.send_replace(true);

        let mut exits: Vec<(String, watch::Receiver<bool>)> = inner
            .slots
            .lock()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.exited.clone()))
            .collect();
        let join_timeout = inner.config.join_timeout();
        let voluntary = timeout(join_timeout, async {
            for (_, exited) in exits.iter_mut() {
                let _ = exited.wait_for(|done| *done).await;
            }
        })
        .await;
        if voluntary.is_err() {
            let stuck: Vec<&str> = exits
                .iter()
                .filter(|(_, exited)| !*exited.borrow())
                .map(|(name, _)| name.as_str())
                .collect();
            warn!("⚠️ Stages still running after {:?}: {:?}", join_timeout, stuck);
        }

        for worker in &inner.workers {
            debug!("Closing stage '{}'", worker.name());
            worker.close().await;
        }

        let watchers: Vec<JoinHandle<()>> = {
            let mut slots = inner.slots.lock();
            slots
                .values_mut()
                .filter_map(|slot| {
                    if !slot.finished() {
                        slot.abort.abort();
                    }
                    slot.watcher.take()
                })
                .collect()
        };
        if timeout(join_timeout, futures::future::join_all(watchers)).await.is_err() {
            warn!("⚠️ Some stage tasks did not finish after abort");
        }

        let open = inner.registry.ids();
        if !open.is_empty() {
            info!("📴 Dropping {} open connection(s)", open.len());
            for id in open {
                inner.registry.remove(id);
            }
        }
        info!("✅ Supervisor stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Total restarts across all stages since start.
    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// One report per stage, in pipeline order.
    pub fn stages(&self) -> Vec<StageReport> {
        let slots = self.inner.slots.lock();
        let mut reports: Vec<StageReport> = self
            .inner
            .workers
            .iter()
            .map(|worker| {
                let slot = slots.get(worker.name());
                StageReport {
                    name: worker.name().to_string(),
                    generation: slot.map(|s| s.generation).unwrap_or_default(),
                    restarts: slot.map(|s| s.restarts).unwrap_or_default(),
                    alive: slot.is_some_and(|s| !s.finished()),
                    status: worker.status().snapshot(),
                }
            })
            .collect();
        reports.sort_by_key(|r| r.status.priority);
        reports
    }
}

impl SupervisorInner {
    fn spawn_task<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.runtime.lock().clone() {
            Some(handle) => handle.spawn(future),
            None => tokio::spawn(future),
        }
    }

    /// Spawns a task for `worker` plus its exit watcher and returns the new slot.
    fn spawn(self: &Arc<Self>, worker: Arc<dyn Worker>, generation: u64, restarts: u64) -> Slot {
        let task = self.spawn_task(run_supervised(worker.clone(), self.interrupt.subscribe()));
        let abort = task.abort_handle();
        let (exited_tx, exited) = watch::channel(false);

        let inner = self.clone();
        let name = worker.name().to_string();
        let watcher = self.spawn_task(async move {
            let exit = Exit::from_join(task.await);
            exited_tx.send_replace(true);
            inner.on_exit(&name, generation, exit);
        });

        Slot {
            worker,
            generation,
            abort,
            exited,
            watcher: Some(watcher),
            restarts,
        }
    }

    fn on_exit(self: &Arc<Self>, name: &str, generation: u64, exit: Exit) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Stage '{}' exited during shutdown: {:?}", name, exit);
            return;
        }
        match &exit {
            Exit::Interrupted => warn!("⚠️ Stage '{}' returned without being stopped", name),
            Exit::Failed(e) => error!("❌ Stage '{}' failed: {}", name, e),
            Exit::Panicked(message) => error!("💥 Stage '{}' panicked: {}", name, message),
            Exit::Aborted => warn!("🔪 Stage '{}' was aborted", name),
        }
        self.restart(name, generation);
    }

    /// Replaces the slot for `name` if it is still at `generation`.
    fn restart(self: &Arc<Self>, name: &str, generation: u64) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get(name) else {
            return false;
        };
        if slot.generation != generation {
            return false;
        }

        let worker = slot.worker.clone();
        let restarts = slot.restarts + 1;
        worker.status().mark_idle();
        let replacement = self.spawn(worker, generation + 1, restarts);
        slots.insert(name.to_string(), replacement);
        self.restarts.fetch_add(1, Ordering::Relaxed);
        info!("🔄 Restarted stage '{}' (generation {}, restart #{})", name, generation + 1, restarts);
        true
    }

    async fn sweep_loop(self: Arc<Self>) {
        let period = self.config.sweep_interval().max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            self.sweep_once().await;
        }
    }

    async fn sweep_once(self: &Arc<Self>) {
        let hang_threshold = self.config.hang_threshold();
        let observed: Vec<(String, u64, bool, Arc<dyn Worker>, AbortHandle, watch::Receiver<bool>)> = self
            .slots
            .lock()
            .iter()
            .map(|(name, slot)| {
                (
                    name.clone(),
                    slot.generation,
                    slot.finished(),
                    slot.worker.clone(),
                    slot.abort.clone(),
                    slot.exited.clone(),
                )
            })
            .collect();

        for (name, generation, finished, worker, abort, mut exited) in observed {
            if finished {
                if self.restart(&name, generation) {
                    warn!("🩺 Sweep found stage '{}' dead", name);
                }
                continue;
            }

            let status = worker.status();
            let Some(running_for) = status.running_for() else {
                continue;
            };
            if running_for <= hang_threshold {
                continue;
            }

            error!(
                "⏳ Stage '{}' hung for {:?}; last activity: {}",
                name,
                running_for,
                status.activity()
            );
            abort.abort();
            if timeout(self.config.join_timeout(), exited.wait_for(|done| *done))
                .await
                .is_err()
            {
                warn!("⚠️ Hung stage '{}' did not finish after abort; replacing it anyway", name);
            }
            self.restart(&name, generation);
        }
    }
}
