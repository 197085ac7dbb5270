mod pg;

pub use pg::{build_pool, PgSampleStore};

use crate::error::StoreError;
use crate::sample::{Kind, Sample};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Consecutive persisted samples of one kind spaced further apart than the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Durable sample history. Implementations must treat `(kind, timestamp)` as the identity of
/// a row and ignore re-inserts of an existing identity.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Appends a batch, returning how many rows were actually new.
    async fn append_batch(&self, samples: &[Sample]) -> Result<u64, StoreError>;

    async fn query_latest(&self, kind: Kind) -> Result<Option<Sample>, StoreError>;

    async fn query_gap_ranges(
        &self,
        kind: Kind,
        threshold: ChronoDuration,
    ) -> Result<Vec<GapRange>, StoreError>;

    async fn query_sample(
        &self,
        kind: Kind,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError>;

    /// Timestamps already persisted for `kind` within `[start, end]`, ascending.
    async fn query_timestamps(
        &self,
        kind: Kind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;
}
