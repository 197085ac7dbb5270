use crate::error::StoreError;
use crate::sample::{Kind, Sample};
use crate::store::{GapRange, SampleStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

/// In-memory `SampleStore` with per-kind fault injection.
#[derive(Default)]
pub struct MemorySampleStore {
    rows: Mutex<BTreeMap<(Kind, DateTime<Utc>), Sample>>,
    failing: Mutex<HashSet<Kind>>,
    hanging: Mutex<HashSet<Kind>>,
    pub append_calls: AtomicU64,
    pub latest_queries: AtomicU64,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(samples: impl IntoIterator<Item = Sample>) -> Self {
        let store = Self::new();
        {
            let mut rows = store.rows.lock().unwrap();
            for sample in samples {
                rows.insert((sample.kind, sample.timestamp), sample);
            }
        }
        store
    }

    pub fn fail_kind(&self, kind: Kind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn heal_kind(&self, kind: Kind) {
        self.failing.lock().unwrap().remove(&kind);
    }

    /// Appends touching `kind` never complete.
    pub fn hang_kind(&self, kind: Kind) {
        self.hanging.lock().unwrap().insert(kind);
    }

    /// Later appends touching `kind` complete again; calls already hanging stay stuck.
    pub fn release_kind(&self, kind: Kind) {
        self.hanging.lock().unwrap().remove(&kind);
    }

    pub fn rows(&self, kind: Kind) -> Vec<Sample> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|sample| sample.kind == kind)
            .cloned()
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl SampleStore for MemorySampleStore {
    async fn append_batch(&self, samples: &[Sample]) -> Result<u64, StoreError> {
        self.append_calls.fetch_add(1, Ordering::Relaxed);
        let hang = {
            let hanging = self.hanging.lock().unwrap();
            samples.iter().any(|sample| hanging.contains(&sample.kind))
        };
        if hang {
            std::future::pending::<()>().await;
        }
        {
            let failing = self.failing.lock().unwrap();
            if let Some(sample) = samples.iter().find(|sample| failing.contains(&sample.kind)) {
                return Err(StoreError::Unavailable(format!(
                    "injected failure for {}",
                    sample.kind
                )));
            }
        }

        let mut rows = self.rows.lock().unwrap();
        let mut inserted = 0;
        for sample in samples {
            let key = (sample.kind, sample.timestamp);
            if !rows.contains_key(&key) {
                rows.insert(key, sample.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn query_latest(&self, kind: Kind) -> Result<Option<Sample>, StoreError> {
        self.latest_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.rows(kind).into_iter().last())
    }

    async fn query_gap_ranges(
        &self,
        kind: Kind,
        threshold: ChronoDuration,
    ) -> Result<Vec<GapRange>, StoreError> {
        let rows = self.rows(kind);
        Ok(rows
            .windows(2)
            .filter(|pair| pair[1].timestamp - pair[0].timestamp > threshold)
            .map(|pair| GapRange {
                start: pair[0].timestamp,
                end: pair[1].timestamp,
            })
            .collect())
    }

    async fn query_sample(
        &self,
        kind: Kind,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError> {
        Ok(self.rows.lock().unwrap().get(&(kind, at)).cloned())
    }

    async fn query_timestamps(
        &self,
        kind: Kind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .range((kind, start)..=(kind, end))
            .map(|(_, sample)| sample.timestamp)
            .collect())
    }
}
