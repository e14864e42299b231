//! Units of work accepted by the queueing pool.

use crate::worker::WorkerStatus;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A unit of work the pool can execute.
///
/// Tasks that want to report progress override [`PoolTask::attach_status`]
/// to keep a handle on the status record of the thread running them.
pub trait PoolTask: Send + 'static {
    /// Runs the task to completion on the calling pool thread.
    fn run(self: Box<Self>);

    /// Called with the running thread's status record just before [`PoolTask::run`].
    fn attach_status(&mut self, _status: Arc<WorkerStatus>) {}

    /// Short description used as the worker's activity string.
    fn describe(&self) -> String {
        String::from("task")
    }
}

/// Adapter that turns a closure into a [`PoolTask`].
pub struct FnTask<F> {
    label: String,
    f: F,
}

impl<F> FnTask<F>
where
    F: FnOnce() + Send + 'static,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

impl<F> PoolTask for FnTask<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (self.f)()
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// A task waiting in the overflow queue.
///
/// Entries order by a monotonic sequence number taken at submission, so the
/// oldest submission always comes out first regardless of clock adjustments
/// or two submissions landing on the same instant. The enqueue instant is only
/// used to measure how long the backlog has been waiting.
pub struct QueueEntry {
    seq: u64,
    enqueued_at: Instant,
    task: Box<dyn PoolTask>,
}

impl QueueEntry {
    pub fn new(seq: u64, enqueued_at: Instant, task: Box<dyn PoolTask>) -> Self {
        Self {
            seq,
            enqueued_at,
            task,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Time spent queued as of `now`.
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    pub fn into_task(self) -> Box<dyn PoolTask> {
        self.task
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("seq", &self.seq)
            .field("enqueued_at", &self.enqueued_at)
            .field("task", &self.task.describe())
            .finish()
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed so that `BinaryHeap` pops the lowest sequence number first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.seq.cmp(&self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn entry(seq: u64, at: Instant) -> QueueEntry {
        QueueEntry::new(seq, at, Box::new(FnTask::new(format!("task-{seq}"), || {})))
    }

    #[test]
    fn test_heap_pops_lowest_sequence_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        // Later sequence numbers with earlier instants must not jump the queue.
        heap.push(entry(7, now));
        heap.push(entry(3, now + Duration::from_millis(5)));
        heap.push(entry(5, now));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.seq())).collect();
        assert_eq!(order, vec![3, 5, 7]);
    }

    #[test]
    fn test_waited_saturates() {
        let now = Instant::now();
        let e = entry(1, now + Duration::from_secs(1));
        assert_eq!(e.waited(now), Duration::ZERO);
    }
}
