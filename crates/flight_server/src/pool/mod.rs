//! Bounded-thread executor with an unbounded overflow queue.
//!
//! The [`QueueingPool`] runs CPU-bound work (the routing logic) on a set of
//! OS threads sized between `core_threads` and `max_threads`. It keeps a tiny
//! primary queue so latency stays low under normal load, and instead of
//! rejecting work once the primary queue is full and every thread is busy it
//! parks the work in an overflow queue ordered by submission sequence.
//!
//! # Submission order
//!
//! 1. Fewer than `core_threads` threads → start a new thread with the task
//! 2. Primary queue has room → enqueue
//! 3. Fewer than `max_threads` threads → start a new thread with the task
//! 4. Otherwise → overflow queue
//!
//! After each task a thread first moves overflow entries into any free
//! primary capacity, then takes its next task from the primary queue.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::worker::{StatusSnapshot, WorkerStatus};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub mod backlog;
pub mod entry;
pub mod ids;

#[cfg(test)]
mod tests;

pub use backlog::{BacklogAlert, BacklogMonitor};
pub use entry::{FnTask, PoolTask, QueueEntry};
pub use ids::{smallest_free_id, IdAllocator};

thread_local! {
    static CURRENT_STATUS: RefCell<Option<Arc<WorkerStatus>>> = RefCell::new(None);
}

/// Status record of the pool thread running the caller, if any.
///
/// Lets code deep inside a task update the activity string the backlog dump
/// and the metrics export report for this thread.
pub fn current_status() -> Option<Arc<WorkerStatus>> {
    CURRENT_STATUS.with(|current| current.borrow().clone())
}

/// Read-only view of the pool for metrics export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub threads: usize,
    pub idle_threads: usize,
    pub primary_queued: usize,
    pub overflow_queued: usize,
    pub oldest_overflow_wait_ms: u64,
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
    pub overflowed: u64,
    pub escalations: u64,
    pub workers: Vec<StatusSnapshot>,
}

struct PoolState {
    primary: VecDeque<Box<dyn PoolTask>>,
    overflow: BinaryHeap<QueueEntry>,
    threads: usize,
    idle: usize,
    ids: IdAllocator,
    statuses: HashMap<usize, Arc<WorkerStatus>>,
    handles: HashMap<usize, thread::JoinHandle<()>>,
    shutdown: bool,
}

impl PoolState {
    fn oldest_overflow_wait(&self, now: Instant) -> Duration {
        self.overflow.peek().map(|e| e.waited(now)).unwrap_or_default()
    }
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    overflowed: AtomicU64,
    escalations: AtomicU64,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    work_ready: Condvar,
    all_retired: Condvar,
    sequence: AtomicU64,
    backlog: Mutex<BacklogMonitor>,
    counters: PoolCounters,
}

/// Backpressure-aware executor. Cheap to clone; clones share the same threads.
#[derive(Clone)]
pub struct QueueingPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for QueueingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueingPool")
            .field("name", &self.inner.config.name)
            .finish()
    }
}

impl QueueingPool {
    /// Creates a pool. Threads are started lazily as work arrives.
    ///
    /// # Arguments
    ///
    /// * `config` - Thread bounds, queue sizes and backlog thresholds. Zero
    ///   sizes are raised to one and `max_threads` to at least `core_threads`.
    ///
    /// # Returns
    ///
    /// A pool with no running threads.
    pub fn new(mut config: PoolConfig) -> Self {
        config.core_threads = config.core_threads.max(1);
        config.max_threads = config.max_threads.max(config.core_threads);
        config.primary_capacity = config.primary_capacity.max(1);

        let backlog = BacklogMonitor::new(
            config.backlog_escalate_size,
            config.backlog_escalate_wait(),
            config.backlog_warn_interval(),
        );

        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    primary: VecDeque::with_capacity(config.primary_capacity),
                    overflow: BinaryHeap::new(),
                    threads: 0,
                    idle: 0,
                    ids: IdAllocator::new(),
                    statuses: HashMap::new(),
                    handles: HashMap::new(),
                    shutdown: false,
                }),
                config,
                work_ready: Condvar::new(),
                all_retired: Condvar::new(),
                sequence: AtomicU64::new(0),
                backlog: Mutex::new(backlog),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Submits a closure with a label used as the worker's activity string.
    ///
    /// # Arguments
    ///
    /// * `label` - Shown in the worker status while the closure runs
    /// * `f` - The work itself
    ///
    /// # Returns
    ///
    /// `Ok(())` once the work is queued or running, `PoolError::ShutDown`
    /// after [`shutdown`](Self::shutdown).
    pub fn submit<F>(&self, label: impl Into<String>, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(Box::new(FnTask::new(label, f)))
    }

    /// Submits a task. Only fails once the pool has been shut down.
    ///
    /// May block briefly on the pool lock; never waits for a task to run.
    ///
    /// # Arguments
    ///
    /// * `task` - Work to run; see the module docs for where it lands
    ///
    /// # Returns
    ///
    /// `Ok(())` if the task was started, queued or parked in overflow.
    pub fn submit_task(&self, task: Box<dyn PoolTask>) -> Result<(), PoolError> {
        let inner = &self.inner;
        let seq = inner.sequence.fetch_add(1, Ordering::SeqCst);
        let mut state = inner.state.lock();

        if state.shutdown {
            return Err(PoolError::ShutDown(inner.config.name.clone()));
        }
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if state.threads < inner.config.core_threads {
            return PoolInner::spawn_worker(inner, &mut state, task);
        }

        if state.primary.len() < inner.config.primary_capacity {
            state.primary.push_back(task);
            inner.work_ready.notify_one();
            return Ok(());
        }

        if state.threads < inner.config.max_threads {
            return PoolInner::spawn_worker(inner, &mut state, task);
        }

        let now = Instant::now();
        state.overflow.push(QueueEntry::new(seq, now, task));
        inner.counters.overflowed.fetch_add(1, Ordering::Relaxed);
        let queued = state.overflow.len();
        let oldest_wait = state.oldest_overflow_wait(now);
        drop(state);

        inner.observe_backlog(queued, oldest_wait, now);
        Ok(())
    }

    /// Point-in-time counters, queue depths and per-thread status.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = inner.state.lock();
        let mut workers: Vec<StatusSnapshot> = state
            .statuses
            .iter()
            .filter(|(id, _)| state.ids.contains(**id))
            .map(|(_, status)| status.snapshot())
            .collect();
        crate::worker::status::sort_snapshots(&mut workers);

        PoolStats {
            name: inner.config.name.clone(),
            threads: state.threads,
            idle_threads: state.idle,
            primary_queued: state.primary.len(),
            overflow_queued: state.overflow.len(),
            oldest_overflow_wait_ms: state.oldest_overflow_wait(Instant::now()).as_millis() as u64,
            submitted: inner.counters.submitted.load(Ordering::Relaxed),
            completed: inner.counters.completed.load(Ordering::Relaxed),
            panicked: inner.counters.panicked.load(Ordering::Relaxed),
            overflowed: inner.counters.overflowed.load(Ordering::Relaxed),
            escalations: inner.counters.escalations.load(Ordering::Relaxed),
            workers,
        }
    }

    /// Stops intake, lets queued work drain and waits a bounded time for the
    /// threads to exit. Threads still running a task after the timeout are
    /// detached and finish on their own.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.shutdown_timeout();
        let mut state = inner.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        inner.work_ready.notify_all();
        info!(
            "🛑 Shutting down pool '{}' ({} threads, {} queued)",
            inner.config.name,
            state.threads,
            state.primary.len() + state.overflow.len()
        );

        while state.threads > 0 {
            if inner.all_retired.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let stragglers = state.threads;
        let handles: Vec<_> = state.handles.drain().collect();
        drop(state);

        if stragglers > 0 {
            warn!(
                "⚠️ Pool '{}' shutdown timed out with {} thread(s) still busy; detaching",
                inner.config.name, stragglers
            );
            return;
        }

        for (id, handle) in handles {
            if handle.join().is_err() {
                warn!("⚠️ Pool thread {}-{} exited abnormally", inner.config.name, id);
            }
        }
    }
}

impl PoolInner {
    fn spawn_worker(
        inner: &Arc<PoolInner>,
        state: &mut PoolState,
        task: Box<dyn PoolTask>,
    ) -> Result<(), PoolError> {
        let id = state.ids.acquire();
        let status = state
            .statuses
            .entry(id)
            .or_insert_with(|| {
                Arc::new(WorkerStatus::new(format!("{}-{}", inner.config.name, id), id as u32))
            })
            .clone();
        status.mark_idle();

        // The first task travels through a slot so it can be recovered if the
        // OS refuses to give us a thread.
        let first = Arc::new(Mutex::new(Some(task)));
        let thread_first = first.clone();
        let thread_inner = inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", inner.config.name, id))
            .spawn(move || {
                let task = thread_first.lock().take();
                PoolInner::worker_main(thread_inner, id, status, task)
            });

        match spawned {
            Ok(handle) => {
                state.threads += 1;
                state.handles.insert(id, handle);
                debug!("🧵 Started pool thread {}-{}", inner.config.name, id);
                Ok(())
            }
            Err(e) => {
                state.ids.release(id);
                let task = first.lock().take();
                if let Some(task) = task {
                    let seq = inner.sequence.fetch_add(1, Ordering::SeqCst);
                    state.overflow.push(QueueEntry::new(seq, Instant::now(), task));
                    inner.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                }
                error!("❌ Failed to start pool thread {}-{}: {}", inner.config.name, id, e);
                if state.threads == 0 {
                    Err(PoolError::Spawn(e.to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn worker_main(
        inner: Arc<PoolInner>,
        id: usize,
        status: Arc<WorkerStatus>,
        first: Option<Box<dyn PoolTask>>,
    ) {
        CURRENT_STATUS.with(|current| *current.borrow_mut() = Some(status.clone()));

        let mut next = first;
        loop {
            let task = match next.take() {
                Some(task) => task,
                None => match inner.next_task(id) {
                    Some(task) => task,
                    None => break,
                },
            };
            inner.run_task(&status, task);
            inner.drain_overflow();
        }

        CURRENT_STATUS.with(|current| *current.borrow_mut() = None);
    }

    fn run_task(&self, status: &Arc<WorkerStatus>, mut task: Box<dyn PoolTask>) {
        task.attach_status(status.clone());
        let _guard = status.execute(task.describe());

        match panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    "💥 Task panicked on {} (last activity: {}): {}",
                    status.name(),
                    status.activity(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Blocks until there is primary work, or returns `None` when the thread
    /// should exit (shutdown with empty queues, or idle above core).
    fn next_task(&self, id: usize) -> Option<Box<dyn PoolTask>> {
        let mut state = self.state.lock();
        loop {
            self.move_overflow(&mut state);
            if let Some(task) = state.primary.pop_front() {
                return Some(task);
            }

            if state.shutdown {
                self.retire(&mut state, id);
                return None;
            }

            state.idle += 1;
            let timed_out = self
                .work_ready
                .wait_for(&mut state, self.config.keep_alive())
                .timed_out();
            state.idle -= 1;

            if timed_out
                && state.primary.is_empty()
                && state.overflow.is_empty()
                && state.threads > self.config.core_threads
            {
                debug!("💤 Pool thread {}-{} retiring after idle keep-alive", self.config.name, id);
                self.retire(&mut state, id);
                return None;
            }
        }
    }

    fn retire(&self, state: &mut PoolState, id: usize) {
        state.threads -= 1;
        state.ids.release(id);
        // Dropping the handle detaches the thread; it is about to return.
        state.handles.remove(&id);
        if let Some(status) = state.statuses.get(&id) {
            status.mark_shutdown();
        }
        if state.threads == 0 {
            self.all_retired.notify_all();
        }
    }

    /// Moves overflow entries into free primary capacity, oldest first.
    fn move_overflow(&self, state: &mut PoolState) -> usize {
        let mut moved = 0;
        while state.primary.len() < self.config.primary_capacity {
            match state.overflow.pop() {
                Some(entry) => {
                    state.primary.push_back(entry.into_task());
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    fn drain_overflow(&self) {
        let mut state = self.state.lock();
        if state.overflow.is_empty() {
            return;
        }
        let moved = self.move_overflow(&mut state);
        // The draining thread takes one itself; wake others for the rest.
        for _ in 1..moved {
            self.work_ready.notify_one();
        }
        let now = Instant::now();
        let queued = state.overflow.len();
        let oldest_wait = state.oldest_overflow_wait(now);
        drop(state);

        self.observe_backlog(queued, oldest_wait, now);
    }

    fn observe_backlog(&self, queued: usize, oldest_wait: Duration, now: Instant) {
        let alert = self.backlog.lock().observe(queued, oldest_wait, now);
        match alert {
            BacklogAlert::Escalate => {
                self.counters.escalations.fetch_add(1, Ordering::Relaxed);
                error!(
                    "🚨 Pool '{}' backlog escalated: {} task(s) in overflow, oldest waiting {}ms",
                    self.config.name,
                    queued,
                    oldest_wait.as_millis()
                );
                for line in self.activity_dump() {
                    error!("🚨   {}", line);
                }
            }
            BacklogAlert::Warn => {
                warn!(
                    "⚠️ Pool '{}' overflow holds {} task(s), oldest waiting {}ms",
                    self.config.name,
                    queued,
                    oldest_wait.as_millis()
                );
            }
            BacklogAlert::Clear | BacklogAlert::Suppressed => {}
        }
    }

    fn activity_dump(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut lines: Vec<(usize, String)> = state
            .statuses
            .iter()
            .filter(|(id, _)| state.ids.contains(**id))
            .map(|(id, status)| {
                let running = status
                    .running_for()
                    .map(|d| format!("running {}ms", d.as_millis()))
                    .unwrap_or_else(|| String::from("idle"));
                (*id, format!("{} [{}]: {}", status.name(), running, status.activity()))
            })
            .collect();
        lines.sort_by_key(|(id, _)| *id);
        lines.into_iter().map(|(_, line)| line).collect()
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}
