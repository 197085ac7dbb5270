
use crate::error::{TelemetryError, TelemetryResult};
use crate::sample::{Kind, Sample};
use crate::store::SampleStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Gaps needing more synthesized points than this are refused by `interpolate`.
pub const MAX_POINTS_PER_GAP: i64 = 50_000;

/// Number of grid points `previous + k·interval` (k ≥ 1) strictly before `next`.
fn grid_points_between(previous: &Sample, next: &Sample, interval: ChronoDuration) -> i64 {
    let span_ms = (next.timestamp - previous.timestamp).num_milliseconds();
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 || span_ms <= interval_ms {
        return 0;
    }
    (span_ms - 1) / interval_ms
}

/// Linearly interpolated points on the `interval` grid anchored at `previous`, strictly
/// between the two samples. Empty unless the samples are more than one interval apart;
/// `GapTooWide` when more than `MAX_POINTS_PER_GAP` points would be needed.
pub fn interpolate(
    previous: &Sample,
    next: &Sample,
    interval: ChronoDuration,
) -> TelemetryResult<Vec<Sample>> {
    if previous.kind != next.kind {
        return Err(TelemetryError::KindMismatch {
            expected: previous.kind,
            actual: next.kind,
        });
    }
    if interval.num_milliseconds() <= 0 {
        return Err(TelemetryError::configuration(
            "sampling interval must be at least one millisecond",
        ));
    }

    let count = grid_points_between(previous, next, interval);
    if count > MAX_POINTS_PER_GAP {
        return Err(TelemetryError::GapTooWide {
            kind: previous.kind,
            points: count,
            limit: MAX_POINTS_PER_GAP,
        });
    }
    let span_ms = (next.timestamp - previous.timestamp).num_milliseconds() as f64;
    let interval_ms = interval.num_milliseconds();
    let delta = next.value - previous.value;

    let points = (1..=count)
        .map(|step| {
            let offset_ms = interval_ms * step;
            let fraction = offset_ms as f64 / span_ms;
            Sample::estimated(
                previous.kind,
                previous.timestamp + ChronoDuration::milliseconds(offset_ms),
                previous.value + delta * fraction,
            )
        })
        .collect();
    Ok(points)
}

fn unmarked(sample: &Sample) -> Sample {
    Sample {
        estimated: false,
        ..sample.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Estimation {
    /// Every grid point between the baseline and the new sample, whether or not it was new.
    pub interpolated: Vec<Sample>,
    /// Rows actually written, boundaries included.
    pub inserted: u64,
    /// Baseline to pass to the next call for this kind.
    pub baseline: Sample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapFillSummary {
    pub kind: Kind,
    pub gaps: usize,
    pub inserted: u64,
    pub skipped_gaps: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GapFillReport {
    pub summaries: Vec<GapFillSummary>,
    pub failures: Vec<(Kind, String)>,
}

impl GapFillReport {
    pub fn inserted(&self) -> u64 {
        self.summaries.iter().map(|summary| summary.inserted).sum()
    }
}

/// Reconstructs missing points of a series on the expected sampling grid.
///
/// Gap-fill runs over the same kind must be serialized by the caller: the
/// duplicate check and the insert are separate store calls.
pub struct Estimator {
    store: Arc<dyn SampleStore>,
    interval: ChronoDuration,
}

impl Estimator {
    pub fn new(store: Arc<dyn SampleStore>, interval: ChronoDuration) -> TelemetryResult<Self> {
        if interval.num_milliseconds() <= 0 {
            return Err(TelemetryError::configuration(format!(
                "sampling interval must be positive, got {}ms",
                interval.num_milliseconds()
            )));
        }
        Ok(Self { store, interval })
    }

    pub fn interval(&self) -> ChronoDuration {
        self.interval
    }

    /// Bridges `latest_known` and `new_sample`, persisting both boundaries unmarked and any
    /// missing grid points marked as estimated.
    ///
    /// Passing `None` makes this look the baseline up in the store, which costs a query;
    /// callers processing a stream should carry `Estimation::baseline` forward instead.
    pub async fn estimate(
        &self,
        new_sample: Sample,
        latest_known: Option<Sample>,
    ) -> TelemetryResult<Estimation> {
        let latest = match latest_known {
            Some(sample) => Some(sample),
            None => self.store.query_latest(new_sample.kind).await?,
        };

        let new_sample = unmarked(&new_sample);
        let Some(latest) = latest else {
            let inserted = self
                .persist_missing(
                    new_sample.kind,
                    new_sample.timestamp,
                    new_sample.timestamp,
                    vec![new_sample.clone()],
                )
                .await?;
            return Ok(Estimation {
                interpolated: Vec::new(),
                inserted,
                baseline: new_sample,
            });
        };

        if latest.kind != new_sample.kind {
            return Err(TelemetryError::KindMismatch {
                expected: latest.kind,
                actual: new_sample.kind,
            });
        }

        if new_sample.timestamp <= latest.timestamp {
            tracing::debug!(
                kind = %new_sample.kind,
                ts = %new_sample.timestamp,
                baseline = %latest.timestamp,
                "sample not newer than baseline; nothing to interpolate"
            );
            let inserted = self
                .persist_missing(
                    new_sample.kind,
                    new_sample.timestamp,
                    new_sample.timestamp,
                    vec![new_sample],
                )
                .await?;
            return Ok(Estimation {
                interpolated: Vec::new(),
                inserted,
                baseline: latest,
            });
        }

        let interpolated = self.plan(&latest, &new_sample)?.unwrap_or_default();
        let mut candidates = Vec::with_capacity(interpolated.len() + 2);
        candidates.push(unmarked(&latest));
        candidates.extend(interpolated.iter().cloned());
        candidates.push(new_sample.clone());

        let inserted = self
            .persist_missing(
                new_sample.kind,
                latest.timestamp,
                new_sample.timestamp,
                candidates,
            )
            .await?;
        if !interpolated.is_empty() {
            tracing::debug!(
                kind = %new_sample.kind,
                points = interpolated.len(),
                inserted,
                "interpolated gap before sample"
            );
        }

        Ok(Estimation {
            interpolated,
            inserted,
            baseline: new_sample,
        })
    }

    /// Scans persisted history of `kind` for gaps wider than the interval and fills them.
    pub async fn fill_gaps(&self, kind: Kind) -> TelemetryResult<GapFillSummary> {
        let ranges = self.store.query_gap_ranges(kind, self.interval).await?;
        let mut summary = GapFillSummary {
            kind,
            gaps: ranges.len(),
            inserted: 0,
            skipped_gaps: 0,
        };

        for range in ranges {
            let start = self.store.query_sample(kind, range.start).await?;
            let end = self.store.query_sample(kind, range.end).await?;
            let (Some(start), Some(end)) = (start, end) else {
                tracing::warn!(%kind, start = %range.start, end = %range.end, "gap boundary vanished; skipping");
                summary.skipped_gaps += 1;
                continue;
            };

            let Some(points) = self.plan(&start, &end)? else {
                summary.skipped_gaps += 1;
                continue;
            };
            summary.inserted += self
                .persist_missing(kind, range.start, range.end, points)
                .await?;
        }

        if summary.gaps > 0 {
            tracing::info!(
                %kind,
                gaps = summary.gaps,
                inserted = summary.inserted,
                skipped = summary.skipped_gaps,
                "gap fill pass finished"
            );
        }
        Ok(summary)
    }

    /// Runs `fill_gaps` kind by kind; a failing kind is logged and does not stop the rest.
    pub async fn fill_all_gaps(&self, kinds: &[Kind]) -> GapFillReport {
        let mut report = GapFillReport::default();
        for &kind in kinds {
            match self.fill_gaps(kind).await {
                Ok(summary) => report.summaries.push(summary),
                Err(err) => {
                    tracing::warn!(%kind, error = %err, "gap fill failed");
                    report.failures.push((kind, err.to_string()));
                }
            }
        }
        report
    }

    fn plan(&self, previous: &Sample, next: &Sample) -> TelemetryResult<Option<Vec<Sample>>> {
        match interpolate(previous, next, self.interval) {
            Ok(points) => Ok(Some(points)),
            Err(TelemetryError::GapTooWide { points, .. }) => {
                tracing::warn!(
                    kind = %previous.kind,
                    start = %previous.timestamp,
                    end = %next.timestamp,
                    points,
                    "gap too wide to interpolate; leaving it open"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn persist_missing(
        &self,
        kind: Kind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        candidates: Vec<Sample>,
    ) -> TelemetryResult<u64> {
        let existing: HashSet<DateTime<Utc>> = self
            .store
            .query_timestamps(kind, start, end)
            .await?
            .into_iter()
            .collect();
        let fresh: Vec<Sample> = candidates
            .into_iter()
            .filter(|sample| !existing.contains(&sample.timestamp))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        Ok(self.store.append_batch(&fresh).await?)
    }
}

/// Periodic maintenance pass over persisted history. Kinds are processed one at a time and
/// a pass never overlaps the previous one.
pub struct GapFillService {
    estimator: Arc<Estimator>,
    interval: Duration,
}

impl GapFillService {
    pub fn new(estimator: Arc<Estimator>, interval: Duration) -> Self {
        Self {
            estimator,
            interval,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            report = self.estimator.fill_all_gaps(&Kind::ALL) => {
                                tracing::debug!(
                                    inserted = report.inserted(),
                                    failures = report.failures.len(),
                                    "gap fill tick"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}
