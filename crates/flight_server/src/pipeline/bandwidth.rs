//! Outbound bandwidth accounting.

use super::{priority, EncodedFrame, FRAME_HEADER_LEN};
use crate::connection::ConnectionRegistry;
use crate::error::StageError;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Window over which the outbound rate is averaged.
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Global outbound totals and rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandwidthStats {
    pub bytes_out: u64,
    pub frames_out: u64,
    pub bytes_per_sec: f64,
}

/// Totals plus a sliding window of recent samples.
#[derive(Debug)]
pub struct BandwidthMeter {
    bytes: AtomicU64,
    frames: AtomicU64,
    window: Duration,
    samples: Mutex<VecDeque<(Instant, usize)>>,
}

impl BandwidthMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            window: window.max(Duration::from_millis(1)),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, bytes: usize) {
        self.record_at(bytes, Instant::now());
    }

    pub(crate) fn record_at(&self, bytes: usize, now: Instant) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock();
        samples.push_back((now, bytes));
        Self::evict(&mut samples, now, self.window);
    }

    fn evict(samples: &mut VecDeque<(Instant, usize)>, now: Instant, window: Duration) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) <= window {
                break;
            }
            samples.pop_front();
        }
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec_at(Instant::now())
    }

    pub(crate) fn bytes_per_sec_at(&self, now: Instant) -> f64 {
        let mut samples = self.samples.lock();
        Self::evict(&mut samples, now, self.window);
        let total: usize = samples.iter().map(|(_, bytes)| bytes).sum();
        total as f64 / self.window.as_secs_f64()
    }

    pub fn stats(&self) -> BandwidthStats {
        BandwidthStats {
            bytes_out: self.bytes.load(Ordering::Relaxed),
            frames_out: self.frames.load(Ordering::Relaxed),
            bytes_per_sec: self.bytes_per_sec(),
        }
    }
}

/// Charges every outbound frame to its connection and the global meter.
pub struct BandwidthWorker {
    status: Arc<WorkerStatus>,
    registry: Arc<ConnectionRegistry>,
    meter: BandwidthMeter,
    input: AsyncMutex<mpsc::Receiver<EncodedFrame>>,
    output: mpsc::Sender<EncodedFrame>,
}

impl BandwidthWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        input: mpsc::Receiver<EncodedFrame>,
        output: mpsc::Sender<EncodedFrame>,
    ) -> Self {
        Self {
            status: Arc::new(WorkerStatus::new("bandwidth", priority::BANDWIDTH)),
            registry,
            meter: BandwidthMeter::new(RATE_WINDOW),
            input: AsyncMutex::new(input),
            output,
        }
    }

    pub fn stats(&self) -> BandwidthStats {
        self.meter.stats()
    }
}

#[async_trait]
impl Worker for BandwidthWorker {
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
        let mut input = self.input.lock().await;
        let frame = input.recv().await.ok_or(StageError::QueueClosed("serialize"))?;

        let _running = self.status.execute(format!("metering for {}", frame.target));
        let wire_len = frame.bytes.len() + FRAME_HEADER_LEN;
        if let Some(connection) = self.registry.get(frame.target) {
            connection.counters().record_out(wire_len);
        }
        self.meter.record(wire_len);

        self.output
            .send(frame)
            .await
            .map_err(|_| StageError::QueueClosed("write"))
    }

    async fn close(&self) {
        self.input.lock().await.close();
        self.status.mark_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_counts_only_the_window() {
        let meter = BandwidthMeter::new(Duration::from_secs(2));
        let start = Instant::now();
        meter.record_at(1_000, start);
        meter.record_at(3_000, start + Duration::from_secs(1));

        let rate = meter.bytes_per_sec_at(start + Duration::from_secs(1));
        assert!((rate - 2_000.0).abs() < f64::EPSILON);

        // The first sample falls out of the window, the second stays.
        let rate = meter.bytes_per_sec_at(start + Duration::from_millis(2_500));
        assert!((rate - 1_500.0).abs() < f64::EPSILON);

        let stats = meter.stats();
        assert_eq!(stats.bytes_out, 4_000);
        assert_eq!(stats.frames_out, 2);
    }
}
