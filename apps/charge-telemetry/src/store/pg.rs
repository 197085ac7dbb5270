use super::{GapRange, SampleStore};
use crate::error::StoreError;
use crate::sample::{Kind, Sample};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;

// Postgres caps bind parameters at 65535 per statement; each row binds five.
const MAX_ROWS_PER_INSERT: usize = 10_000;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgSampleStore {
    pool: PgPool,
}

impl PgSampleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meter_samples (
                kind text not null,
                ts timestamptz not null,
                value double precision not null,
                estimated boolean not null default false,
                inserted_at timestamptz not null default now(),
                primary key (kind, ts)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn sample_from_row(kind: Kind, row: &PgRow) -> Result<Sample, StoreError> {
    Ok(Sample {
        kind,
        timestamp: row.try_get::<DateTime<Utc>, _>("ts")?,
        value: row.try_get::<f64, _>("value")?,
        estimated: row.try_get::<bool, _>("estimated")?,
    })
}

#[async_trait]
impl SampleStore for PgSampleStore {
    async fn append_batch(&self, samples: &[Sample]) -> Result<u64, StoreError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let inserted_at = Utc::now();
        let mut inserted = 0u64;
        for chunk in samples.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO meter_samples (kind, ts, value, estimated, inserted_at) ",
            );
            builder.push_values(chunk.iter(), |mut b, sample| {
                b.push_bind(sample.kind.as_str())
                    .push_bind(sample.timestamp)
                    .push_bind(sample.value)
                    .push_bind(sample.estimated)
                    .push_bind(inserted_at);
            });
            builder.push(" ON CONFLICT (kind, ts) DO NOTHING");

            let result = builder.build().execute(&self.pool).await?;
            inserted += result.rows_affected();
        }

        let skipped = (samples.len() as u64).saturating_sub(inserted);
        if skipped > 0 {
            tracing::debug!(inserted, skipped, "skipped duplicate sample rows");
        }
        Ok(inserted)
    }

    async fn query_latest(&self, kind: Kind) -> Result<Option<Sample>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT ts, value, estimated
            FROM meter_samples
            WHERE kind = $1
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| sample_from_row(kind, &row)).transpose()
    }

    async fn query_gap_ranges(
        &self,
        kind: Kind,
        threshold: ChronoDuration,
    ) -> Result<Vec<GapRange>, StoreError> {
        let threshold_secs = threshold.num_milliseconds() as f64 / 1000.0;
        let rows = sqlx::query(
            r#"
            SELECT prev_ts, ts
            FROM (
                SELECT ts, LAG(ts) OVER (ORDER BY ts) AS prev_ts
                FROM meter_samples
                WHERE kind = $1
            ) spaced
            WHERE prev_ts IS NOT NULL
              AND ts - prev_ts > make_interval(secs => $2)
            ORDER BY prev_ts ASC
            "#,
        )
        .bind(kind.as_str())
        .bind(threshold_secs)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(GapRange {
                    start: row.try_get::<DateTime<Utc>, _>("prev_ts")?,
                    end: row.try_get::<DateTime<Utc>, _>("ts")?,
                })
            })
            .collect()
    }

    async fn query_sample(
        &self,
        kind: Kind,
        at: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError> {
        let row = sqlx::query(
            "SELECT ts, value, estimated FROM meter_samples WHERE kind = $1 AND ts = $2",
        )
        .bind(kind.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| sample_from_row(kind, &row)).transpose()
    }

    async fn query_timestamps(
        &self,
        kind: Kind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let timestamps: Vec<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT ts
            FROM meter_samples
            WHERE kind = $1 AND ts >= $2 AND ts <= $3
            ORDER BY ts ASC
            "#,
        )
        .bind(kind.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(timestamps)
    }
}
