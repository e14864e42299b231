//! Per-worker execution state tracking.
//!
//! A [`WorkerStatus`] is shared between the thing doing the work (a pipeline
//! stage or a pool thread) and the things watching it (the supervisor's hang
//! detection and the metrics export). Writers call [`WorkerStatus::execute`]
//! around each unit of work; readers take a [`StatusSnapshot`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of latency samples kept per worker.
pub const LATENCY_SAMPLES: usize = 64;

/// Execution state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Waiting for work
    Idle,
    /// Currently executing a unit of work
    Running,
    /// Closed by shutdown; no further work will be executed
    Shutdown,
}

/// Fixed-capacity ring of the most recent execution latencies.
#[derive(Debug, Clone)]
pub struct LatencyRing {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records a sample, evicting the oldest once the ring is full.
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }
}

#[derive(Debug)]
struct StatusInner {
    state: ExecutionState,
    execution_started: Option<Instant>,
    activity: String,
    latencies: LatencyRing,
    executed: u64,
}

/// Execution record for one worker.
///
/// The `priority` is only a sort key so that stage listings come out in
/// pipeline order; it has no scheduling meaning.
#[derive(Debug)]
pub struct WorkerStatus {
    name: String,
    priority: u32,
    inner: Mutex<StatusInner>,
}

impl WorkerStatus {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            inner: Mutex::new(StatusInner {
                state: ExecutionState::Idle,
                execution_started: None,
                activity: String::from("created"),
                latencies: LatencyRing::new(LATENCY_SAMPLES),
                executed: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Marks the start of a unit of work.
    pub fn begin(&self, activity: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.state == ExecutionState::Shutdown {
            return;
        }
        inner.state = ExecutionState::Running;
        inner.execution_started = Some(Instant::now());
        inner.activity = activity.into();
    }

    /// Marks the end of the current unit of work and records its latency.
    pub fn end(&self) {
        let mut inner = self.inner.lock();
        if let Some(started) = inner.execution_started.take() {
            inner.latencies.record(started.elapsed());
            inner.executed += 1;
        }
        if inner.state == ExecutionState::Running {
            inner.state = ExecutionState::Idle;
        }
    }

    /// Marks the start of a unit of work and returns a guard that ends it on drop.
    ///
    /// Dropping the guard also covers the case where the surrounding task is
    /// aborted mid-step, so an aborted stage never looks hung forever.
    pub fn execute(&self, activity: impl Into<String>) -> ExecutionGuard<'_> {
        self.begin(activity);
        ExecutionGuard { status: self }
    }

    /// Replaces the activity string without changing the execution state.
    pub fn set_activity(&self, activity: impl Into<String>) {
        self.inner.lock().activity = activity.into();
    }

    pub fn mark_shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.state = ExecutionState::Shutdown;
        inner.execution_started = None;
        inner.activity = String::from("shutdown");
    }

    /// Reopens a status previously marked shut down.
    pub fn mark_idle(&self) {
        let mut inner = self.inner.lock();
        inner.state = ExecutionState::Idle;
        inner.execution_started = None;
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.lock().state
    }

    /// How long the current unit of work has been executing, if any.
    pub fn running_for(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            ExecutionState::Running => inner.execution_started.map(|t| t.elapsed()),
            _ => None,
        }
    }

    pub fn activity(&self) -> String {
        self.inner.lock().activity.clone()
    }

    pub fn executed(&self) -> u64 {
        self.inner.lock().executed
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.lock();
        let running_for = match inner.state {
            ExecutionState::Running => inner.execution_started.map(|t| t.elapsed()),
            _ => None,
        };
        StatusSnapshot {
            name: self.name.clone(),
            priority: self.priority,
            state: inner.state,
            running_for_ms: running_for.map(|d| d.as_millis() as u64),
            activity: inner.activity.clone(),
            executed: inner.executed,
            avg_latency_us: inner.latencies.average().map(|d| d.as_micros() as u64),
            max_latency_us: inner.latencies.max().map(|d| d.as_micros() as u64),
        }
    }
}

/// Ends the current unit of work when dropped.
#[derive(Debug)]
pub struct ExecutionGuard<'a> {
    status: &'a WorkerStatus,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.status.end();
    }
}

/// Point-in-time copy of a [`WorkerStatus`] for supervision and export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub priority: u32,
    pub state: ExecutionState,
    pub running_for_ms: Option<u64>,
    pub activity: String,
    pub executed: u64,
    pub avg_latency_us: Option<u64>,
    pub max_latency_us: Option<u64>,
}

/// Sorts snapshots by priority, then name.
pub fn sort_snapshots(snapshots: &mut [StatusSnapshot]) {
    snapshots.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ring_evicts_oldest() {
        let mut ring = LatencyRing::new(3);
        for ms in [10, 20, 30, 40] {
            ring.record(Duration::from_millis(ms));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.max(), Some(Duration::from_millis(40)));
        assert_eq!(ring.average(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_guard_marks_idle_on_drop() {
        let status = WorkerStatus::new("decode", 2);
        {
            let _guard = status.execute("decoding frame from 7");
            assert_eq!(status.state(), ExecutionState::Running);
            assert!(status.running_for().is_some());
            assert_eq!(status.activity(), "decoding frame from 7");
        }
        assert_eq!(status.state(), ExecutionState::Idle);
        assert!(status.running_for().is_none());
        assert_eq!(status.executed(), 1);
    }

    #[test]
    fn test_shutdown_is_sticky() {
        let status = WorkerStatus::new("write", 7);
        status.mark_shutdown();
        status.begin("late work");
        assert_eq!(status.state(), ExecutionState::Shutdown);
        status.mark_idle();
        assert_eq!(status.state(), ExecutionState::Idle);
    }

    #[test]
    fn test_snapshot_sorting() {
        let mut snapshots = vec![
            WorkerStatus::new("write", 7).snapshot(),
            WorkerStatus::new("accept", 0).snapshot(),
            WorkerStatus::new("decode", 2).snapshot(),
        ];
        sort_snapshots(&mut snapshots);
        let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["accept", "decode", "write"]);
    }
}
