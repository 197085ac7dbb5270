use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Measurement channel a sample belongs to. The unit of `Sample::value` is implied by the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    ImportedEnergy,
    ExportedEnergy,
    Power,
    Current,
    Voltage,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::ImportedEnergy,
        Kind::ExportedEnergy,
        Kind::Power,
        Kind::Current,
        Kind::Voltage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::ImportedEnergy => "imported_energy",
            Kind::ExportedEnergy => "exported_energy",
            Kind::Power => "power",
            Kind::Current => "current",
            Kind::Voltage => "voltage",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Kind::ImportedEnergy | Kind::ExportedEnergy => "Wh",
            Kind::Power => "W",
            Kind::Current => "A",
            Kind::Voltage => "V",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        Kind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| anyhow!("unknown sample kind {trimmed:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub kind: Kind,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// True iff the point was synthesized by the estimator rather than measured.
    pub estimated: bool,
}

impl Sample {
    pub fn measured(kind: Kind, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            kind,
            timestamp,
            value,
            estimated: false,
        }
    }

    pub fn estimated(kind: Kind, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            kind,
            timestamp,
            value,
            estimated: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BorrowedReading<'a> {
    #[serde(borrow)]
    kind: &'a str,
    value: f64,
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> Result<DateTime<Utc>> {
        match self {
            BorrowedTimestamp::Str(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| anyhow!("invalid timestamp {s:?}: {err}")),
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(secs) => millis_to_dt((*secs * 1000.0).round() as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp {ms}ms out of range"))
}

/// Parses one reading payload, e.g. `{"kind":"power","value":7200.5,"timestamp":"2024-05-01T10:00:00Z"}`.
///
/// Integer timestamps are unix milliseconds, floats are unix seconds. A missing timestamp
/// means the reading was observed now.
pub fn parse_sample_payload(payload: &mut [u8]) -> Result<Sample> {
    let reading: BorrowedReading = simd_json::from_slice(payload)?;
    let kind: Kind = reading.kind.parse()?;
    if !reading.value.is_finite() {
        return Err(anyhow!("non-finite value for {kind}"));
    }
    let timestamp = match reading.timestamp.as_ref() {
        Some(ts) => ts.to_datetime()?,
        None => Utc::now(),
    };
    Ok(Sample::measured(kind, timestamp, reading.value))
}
