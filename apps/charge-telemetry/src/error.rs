use crate::sample::Kind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Estimation was asked to bridge two different measurement channels.
    #[error("sample kind mismatch: baseline is {expected}, new sample is {actual}")]
    KindMismatch { expected: Kind, actual: Kind },
    /// Bridging the gap would synthesize more points than one pass is allowed to hold.
    #[error("{kind} gap needs {points} interpolated points, above the limit of {limit}")]
    GapTooWide { kind: Kind, points: i64, limit: i64 },
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl TelemetryError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<sqlx::Error> for TelemetryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(StoreError::Database(err))
    }
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
