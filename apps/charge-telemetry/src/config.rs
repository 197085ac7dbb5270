use crate::charge_time::DEFAULT_NOMINAL_VOLTAGE;
use crate::error::TelemetryError;
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
const DEFAULT_SAMPLE_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_GAP_FILL_INTERVAL_SECONDS: u64 = 900;
const DEFAULT_DB_POOL_SIZE: u32 = 10;

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    telemetry_flush_interval_ms: Option<u64>,
    #[serde(default)]
    telemetry_shutdown_grace_ms: Option<u64>,
    #[serde(default)]
    telemetry_sample_interval_seconds: Option<u64>,
    #[serde(default)]
    telemetry_gap_fill_enabled: Option<bool>,
    #[serde(default)]
    telemetry_gap_fill_interval_seconds: Option<u64>,
    #[serde(default)]
    telemetry_nominal_voltage: Option<f64>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "charge-telemetry failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "charge-telemetry failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub flush_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub sample_interval_seconds: u64,
    pub gap_fill_enabled: bool,
    pub gap_fill_interval_seconds: u64,
    pub nominal_voltage: f64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Environment variables win over the setup file; the setup file wins over defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let overrides = var("TELEMETRY_SETUP_CONFIG_PATH")
            .map(PathBuf::from)
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();

        let database_url = var("TELEMETRY_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .or_else(|| {
                overrides
                    .database_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
            .context("TELEMETRY_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let db_pool_size = parse_or(&var, "TELEMETRY_DB_POOL_SIZE", None, DEFAULT_DB_POOL_SIZE)?;
        let flush_interval_ms = parse_or(
            &var,
            "TELEMETRY_FLUSH_INTERVAL_MS",
            overrides.telemetry_flush_interval_ms,
            DEFAULT_FLUSH_INTERVAL_MS,
        )?;
        let shutdown_grace_ms = parse_or(
            &var,
            "TELEMETRY_SHUTDOWN_GRACE_MS",
            overrides.telemetry_shutdown_grace_ms,
            DEFAULT_SHUTDOWN_GRACE_MS,
        )?;
        let sample_interval_seconds = parse_or(
            &var,
            "TELEMETRY_SAMPLE_INTERVAL_SECONDS",
            overrides.telemetry_sample_interval_seconds,
            DEFAULT_SAMPLE_INTERVAL_SECONDS,
        )?;
        let gap_fill_enabled = match var("TELEMETRY_GAP_FILL_ENABLED") {
            Some(value) => parse_flag("TELEMETRY_GAP_FILL_ENABLED", &value)?,
            None => overrides.telemetry_gap_fill_enabled.unwrap_or(true),
        };
        let gap_fill_interval_seconds = parse_or(
            &var,
            "TELEMETRY_GAP_FILL_INTERVAL_SECONDS",
            overrides.telemetry_gap_fill_interval_seconds,
            DEFAULT_GAP_FILL_INTERVAL_SECONDS,
        )?;
        let nominal_voltage = parse_or(
            &var,
            "TELEMETRY_NOMINAL_VOLTAGE",
            overrides.telemetry_nominal_voltage,
            DEFAULT_NOMINAL_VOLTAGE,
        )?;
        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");

        let config = Self {
            database_url,
            db_pool_size,
            flush_interval_ms,
            shutdown_grace_ms,
            sample_interval_seconds,
            gap_fill_enabled,
            gap_fill_interval_seconds,
            nominal_voltage,
            otlp_endpoint,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), TelemetryError> {
        let positive = [
            ("TELEMETRY_DB_POOL_SIZE", u64::from(self.db_pool_size)),
            ("TELEMETRY_FLUSH_INTERVAL_MS", self.flush_interval_ms),
            ("TELEMETRY_SAMPLE_INTERVAL_SECONDS", self.sample_interval_seconds),
            ("TELEMETRY_GAP_FILL_INTERVAL_SECONDS", self.gap_fill_interval_seconds),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(TelemetryError::configuration(format!(
                "{key} must be greater than zero"
            )));
        }
        if !self.nominal_voltage.is_finite() || self.nominal_voltage <= 0.0 {
            return Err(TelemetryError::configuration(format!(
                "TELEMETRY_NOMINAL_VOLTAGE must be a positive number, got {}",
                self.nominal_voltage
            )));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn sample_interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.sample_interval_seconds as i64)
    }

    pub fn gap_fill_interval(&self) -> Duration {
        Duration::from_secs(self.gap_fill_interval_seconds)
    }
}

fn parse_or<T, V>(var: &V, key: &str, fallback: Option<T>, default: T) -> Result<T, TelemetryError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| TelemetryError::configuration(format!("{key}={raw:?} is invalid: {err}"))),
        None => Ok(fallback.unwrap_or(default)),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, TelemetryError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TelemetryError::configuration(format!(
            "{key}={raw:?} is not a boolean"
        ))),
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
