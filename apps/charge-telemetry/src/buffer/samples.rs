use super::typed::TypedBuffer;
use crate::error::TelemetryError;
use crate::flush::{Batch, Flushable};
use crate::sample::{Kind, Sample};
use crate::store::SampleStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct BufferStats {
    accepted: AtomicU64,
    queue_depth: AtomicU64,
}

/// Live ingestion buffer for measured samples, partitioned by kind.
#[derive(Clone, Default)]
pub struct SampleBuffer {
    inner: Arc<TypedBuffer<Kind, Sample>>,
    stats: Arc<BufferStats>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks on persistence and gives no backpressure; memory is bounded only by
    /// the flush cadence.
    pub fn add(&self, sample: Sample) {
        if sample.estimated {
            // Estimated points are written by the estimator directly.
            tracing::warn!(kind = %sample.kind, ts = %sample.timestamp, "refusing estimated sample on ingest path");
            return;
        }
        let kind = sample.kind;
        self.inner.add(kind, sample);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, %kind, "buffered sample");
    }

    pub fn drain_all(&self) -> Vec<(Kind, Vec<Sample>)> {
        let drained = self.inner.drain_all();
        let count: usize = drained.iter().map(|(_, samples)| samples.len()).sum();
        self.release(count);
        drained
    }

    pub fn drain(&self, kind: Kind) -> Vec<Sample> {
        let drained = self.inner.drain(kind);
        self.release(drained.len());
        drained
    }

    pub fn requeue(&self, kind: Kind, samples: Vec<Sample>) {
        let len = samples.len() as u64;
        self.inner.requeue(kind, samples);
        self.stats.queue_depth.fetch_add(len, Ordering::Relaxed);
    }

    pub fn kinds(&self) -> Vec<Kind> {
        self.inner.kinds()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn queue_depth(&self) -> u64 {
        self.stats.queue_depth.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }

    fn release(&self, count: usize) {
        let count = count as u64;
        let _ = self
            .stats
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                Some(depth.saturating_sub(count))
            });
    }
}

/// Connects a `SampleBuffer` to its persistence target for the flush coordinator.
pub struct SampleFlusher {
    buffer: SampleBuffer,
    store: Arc<dyn SampleStore>,
}

impl SampleFlusher {
    pub fn new(buffer: SampleBuffer, store: Arc<dyn SampleStore>) -> Self {
        Self { buffer, store }
    }
}

#[async_trait]
impl Flushable for SampleFlusher {
    fn drain(&self) -> Vec<Batch> {
        self.buffer
            .drain_all()
            .into_iter()
            .map(|(kind, samples)| Batch { kind, samples })
            .collect()
    }

    async fn persist(&self, batch: &Batch) -> Result<u64, TelemetryError> {
        Ok(self.store.append_batch(&batch.samples).await?)
    }

    fn requeue(&self, batch: Batch) {
        self.buffer.requeue(batch.kind, batch.samples);
    }
}
