#[cfg(test)]
mod tests;

use crate::error::TelemetryError;
use crate::sample::{Kind, Sample};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Drained contents of one partition of a flushable source.
#[derive(Debug, Clone)]
pub struct Batch {
    pub kind: Kind,
    pub samples: Vec<Sample>,
}

/// A buffering component the coordinator can flush.
///
/// `drain` must be cheap and in-memory; all I/O belongs in `persist`.
#[async_trait]
pub trait Flushable: Send + Sync + 'static {
    fn drain(&self) -> Vec<Batch>;

    async fn persist(&self, batch: &Batch) -> Result<u64, TelemetryError>;

    /// Puts back a batch whose persistence failed so the next cycle picks it up again.
    fn requeue(&self, batch: Batch);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    Periodic,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Draining,
    Persisting,
}

impl FlushState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FlushState::Draining,
            2 => FlushState::Persisting,
            _ => FlushState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FlushState::Idle => 0,
            FlushState::Draining => 1,
            FlushState::Persisting => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FlushOutcome {
    Persisted { inserted: u64 },
    /// Periodic failure; the batch went back into its source.
    Requeued(String),
    /// Shutdown failure; the batch is lost.
    Dropped(String),
    /// Abandoned when the shutdown grace period ran out or the host cancelled.
    TimedOut,
}

impl FlushOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FlushOutcome::Persisted { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlushEntry {
    pub source: String,
    pub kind: Kind,
    pub samples: usize,
    pub outcome: FlushOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlushReport {
    pub mode: FlushMode,
    pub entries: Vec<FlushEntry>,
    /// The cycle never started because the budget ran out while waiting for a running cycle.
    pub abandoned: bool,
    pub elapsed_ms: u64,
}

pub type ShutdownReport = FlushReport;

impl FlushReport {
    fn empty(mode: FlushMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            abandoned: false,
            elapsed_ms: 0,
        }
    }

    pub fn persisted_samples(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outcome.is_success())
            .map(|entry| entry.samples)
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FlushEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.outcome.is_success())
    }

    pub fn is_clean(&self) -> bool {
        !self.abandoned && self.failures().next().is_none()
    }
}

#[derive(Debug)]
pub struct FlushStats {
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_persists: AtomicU64,
    pub persisted_samples: AtomicU64,
    pub failed_batches: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl FlushStats {
    pub fn new() -> Self {
        Self {
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_persists: AtomicU64::new(0),
            persisted_samples: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    fn record_cycle(&self, report: &FlushReport, micros: u64) {
        let persisted = report.persisted_samples() as u64;
        self.persisted_samples.fetch_add(persisted, Ordering::Relaxed);
        self.last_batch_len.store(persisted, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
        if report.is_clean() {
            if let Ok(mut guard) = self.last_error.lock() {
                *guard = None;
            }
        }
    }
}

impl Default for FlushStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds a cycle: an optional deadline plus the host's cancellation signal.
struct Budget {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Budget {
    fn unbounded() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    async fn exhausted(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

struct Registered {
    name: String,
    source: Arc<dyn Flushable>,
}

/// Drains every registered source into persistence on a schedule and once more at shutdown.
pub struct FlushCoordinator {
    sources: RwLock<Vec<Registered>>,
    state: AtomicU8,
    cycle: tokio::sync::Mutex<()>,
    stats: Arc<FlushStats>,
    flush_interval: Duration,
}

impl FlushCoordinator {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            state: AtomicU8::new(FlushState::Idle.as_u8()),
            cycle: tokio::sync::Mutex::new(()),
            stats: Arc::new(FlushStats::new()),
            flush_interval,
        }
    }

    pub fn register(&self, name: impl Into<String>, source: Arc<dyn Flushable>) {
        let name = name.into();
        tracing::debug!(source = %name, "registered flush source");
        if let Ok(mut sources) = self.sources.write() {
            sources.push(Registered { name, source });
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .read()
            .map(|sources| sources.iter().map(|entry| entry.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn state(&self) -> FlushState {
        FlushState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> Arc<FlushStats> {
        self.stats.clone()
    }

    /// Buffers accumulate on their own; there is nothing to prepare.
    pub fn on_start(&self) {
        tracing::debug!(sources = self.source_names().len(), "flush coordinator started");
    }

    /// Final flush under the host's grace period. Never retries; whatever is still
    /// persisting when the period elapses or `cancel` fires is abandoned.
    pub async fn on_stop(&self, grace: Duration, cancel: CancellationToken) -> ShutdownReport {
        let budget = Budget {
            deadline: Some(Instant::now() + grace),
            cancel,
        };
        let report = self.run_cycle(FlushMode::Shutdown, &budget).await;
        let failed = report.failures().count();
        if report.is_clean() {
            tracing::info!(
                persisted = report.persisted_samples(),
                batches = report.entries.len(),
                elapsed_ms = report.elapsed_ms,
                "shutdown flush complete"
            );
        } else {
            tracing::warn!(
                persisted = report.persisted_samples(),
                failed,
                abandoned = report.abandoned,
                elapsed_ms = report.elapsed_ms,
                "shutdown flush finished with losses"
            );
        }
        report
    }

    pub async fn flush_now(&self, mode: FlushMode) -> FlushReport {
        self.run_cycle(mode, &Budget::unbounded()).await
    }

    /// Runs periodic cycles until `cancel` fires. A cycle in progress is cut short too: its
    /// unfinished batches go back into their sources for the shutdown flush.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let budget = Budget {
                deadline: None,
                cancel: cancel.clone(),
            };
            let mut ticker = tokio::time::interval(self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.run_cycle(FlushMode::Periodic, &budget).await;
                        if !report.is_clean() {
                            tracing::warn!(
                                failed = report.failures().count(),
                                "periodic flush left batches for the next cycle"
                            );
                        }
                    }
                }
            }
            tracing::debug!("periodic flush loop stopped");
        })
    }

    fn set_state(&self, state: FlushState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn snapshot_sources(&self) -> Vec<(String, Arc<dyn Flushable>)> {
        self.sources
            .read()
            .map(|sources| {
                sources
                    .iter()
                    .map(|entry| (entry.name.clone(), entry.source.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn run_cycle(&self, mode: FlushMode, budget: &Budget) -> FlushReport {
        let _cycle = tokio::select! {
            guard = self.cycle.lock() => guard,
            _ = budget.exhausted() => {
                tracing::warn!(?mode, "flush budget exhausted while waiting for a running cycle");
                let mut report = FlushReport::empty(mode);
                report.abandoned = true;
                return report;
            }
        };

        let started = std::time::Instant::now();
        self.set_state(FlushState::Draining);
        let mut drained = Vec::new();
        for (name, source) in self.snapshot_sources() {
            for batch in source.drain() {
                if !batch.samples.is_empty() {
                    drained.push((name.clone(), source.clone(), batch));
                }
            }
        }

        let mut report = FlushReport::empty(mode);
        if drained.is_empty() {
            self.set_state(FlushState::Idle);
            return report;
        }

        self.set_state(FlushState::Persisting);
        let mut tasks = Vec::with_capacity(drained.len());
        for (name, source, batch) in drained {
            let kind = batch.kind;
            let len = batch.samples.len();
            let task_source = source.clone();
            // Periodic batches stay recoverable if their task panics or is cut off.
            let retained = (mode == FlushMode::Periodic).then(|| batch.clone());
            self.stats.inflight_persists.fetch_add(1, Ordering::Relaxed);
            // One task per batch so a slow or panicking partition cannot hold up the rest.
            let handle = tokio::spawn(async move {
                let result = task_source.persist(&batch).await;
                (batch, result)
            });
            tasks.push((name, source, kind, len, retained, handle));
        }

        for (name, source, kind, len, retained, mut handle) in tasks {
            let outcome = tokio::select! {
                biased;
                joined = &mut handle => match joined {
                    Ok((_, Ok(inserted))) => FlushOutcome::Persisted { inserted },
                    Ok((batch, Err(err))) => {
                        self.stats.record_error(err.to_string());
                        match mode {
                            FlushMode::Periodic => {
                                source.requeue(batch);
                                FlushOutcome::Requeued(err.to_string())
                            }
                            FlushMode::Shutdown => FlushOutcome::Dropped(err.to_string()),
                        }
                    }
                    Err(join_err) => {
                        let message = format!("persist task failed: {join_err}");
                        self.stats.record_error(message.clone());
                        match retained {
                            Some(batch) => {
                                source.requeue(batch);
                                FlushOutcome::Requeued(message)
                            }
                            None => FlushOutcome::Dropped(message),
                        }
                    }
                },
                _ = budget.exhausted() => {
                    handle.abort();
                    self.stats.record_error(format!("{name}/{kind} persist abandoned"));
                    match retained {
                        Some(batch) => {
                            // Rows the aborted task already wrote are ignored on re-insert.
                            source.requeue(batch);
                            FlushOutcome::Requeued("cycle cancelled before persist finished".to_string())
                        }
                        None => FlushOutcome::TimedOut,
                    }
                }
            };
            self.stats.inflight_persists.fetch_sub(1, Ordering::Relaxed);

            match &outcome {
                FlushOutcome::Persisted { inserted } => {
                    tracing::debug!(source = %name, %kind, len, inserted, "flushed batch");
                }
                FlushOutcome::Requeued(err) => {
                    tracing::warn!(source = %name, %kind, len, error = %err, "flush failed; batch requeued");
                }
                FlushOutcome::Dropped(err) => {
                    tracing::error!(source = %name, %kind, len, error = %err, "flush failed; batch dropped");
                }
                FlushOutcome::TimedOut => {
                    tracing::warn!(source = %name, %kind, len, "flush abandoned at end of grace period");
                }
            }

            report.entries.push(FlushEntry {
                source: name,
                kind,
                samples: len,
                outcome,
            });
        }

        let micros = started.elapsed().as_micros() as u64;
        report.elapsed_ms = micros / 1000;
        self.stats.record_cycle(&report, micros);
        self.set_state(FlushState::Idle);
        report
    }
}
