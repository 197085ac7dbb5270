use anyhow::Result;
use charge_telemetry::buffer::{SampleBuffer, SampleFlusher};
use charge_telemetry::charge_time::{CarState, ChargeTimeEstimator};
use charge_telemetry::config::Config;
use charge_telemetry::estimator::{Estimator, GapFillService};
use charge_telemetry::flush::FlushCoordinator;
use charge_telemetry::sample::parse_sample_payload;
use charge_telemetry::store::{build_pool, PgSampleStore};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,charge_telemetry=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "charge-telemetry"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

/// Reads newline-delimited JSON from stdin until EOF. Lines carrying a car record get a
/// charge projection; everything else is treated as a meter sample.
async fn ingest_stdin(buffer: SampleBuffer, projector: ChargeTimeEstimator) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut car_bytes = line.as_bytes().to_vec();
        if let Ok(mut car) = simd_json::serde::from_slice::<CarState>(&mut car_bytes) {
            match projector.update_projected_ready_time(&mut car, Utc::now()) {
                Some(ready_at) => {
                    tracing::info!(car = %car.id, name = %car.name, %ready_at, "projected charge ready time")
                }
                None => tracing::info!(car = %car.id, name = %car.name, "car cannot charge; no projection"),
            }
            continue;
        }

        let mut bytes = line.as_bytes().to_vec();
        match parse_sample_payload(&mut bytes) {
            Ok(sample) => buffer.add(sample),
            Err(err) => tracing::warn!(error = %err, "skipping malformed telemetry line"),
        }
    }
    tracing::info!("stdin closed");
    Ok(())
}

/// Token cancelled once `signal` resolves successfully.
fn cancel_on<F>(signal: F) -> CancellationToken
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if signal.await.is_ok() {
            tracing::warn!("second shutdown signal received; cutting the shutdown flush short");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = Arc::new(PgSampleStore::new(pool));
    store.ensure_schema().await?;

    let projector = ChargeTimeEstimator::new(config.nominal_voltage)?;
    let buffer = SampleBuffer::new();
    let coordinator = Arc::new(FlushCoordinator::new(config.flush_interval()));
    coordinator.register(
        "meter_samples",
        Arc::new(SampleFlusher::new(buffer.clone(), store.clone())),
    );
    coordinator.on_start();

    let cancel = CancellationToken::new();
    let flush_handle = coordinator.clone().start(cancel.clone());

    let gap_fill_handle = if config.gap_fill_enabled {
        let estimator = Arc::new(Estimator::new(store.clone(), config.sample_interval())?);
        Some(GapFillService::new(estimator, config.gap_fill_interval()).start(cancel.clone()))
    } else {
        tracing::info!("gap fill disabled");
        None
    };

    tracing::info!(
        flush_interval_ms = config.flush_interval_ms,
        sample_interval_seconds = config.sample_interval_seconds,
        "charge-telemetry started"
    );

    let ingest_handle = tokio::spawn(ingest_stdin(buffer.clone(), projector));

    tokio::select! {
        res = ingest_handle => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(error = %err, "stdin ingestion failed"),
                Err(err) => tracing::error!(error = %err, "stdin ingestion task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    let force_stop = cancel_on(tokio::signal::ctrl_c());
    cancel.cancel();
    if let Err(err) = flush_handle.await {
        tracing::warn!(error = %err, "flush loop ended abnormally");
    }
    if let Some(handle) = gap_fill_handle {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "gap fill loop ended abnormally");
        }
    }

    let report = coordinator
        .on_stop(config.shutdown_grace(), force_stop)
        .await;
    match serde_json::to_string(&report) {
        Ok(json) => tracing::info!(report = %json, "shutdown flush finished"),
        Err(err) => tracing::warn!(error = %err, "failed to serialize shutdown report"),
    }
    if !report.is_clean() {
        tracing::warn!(
            failures = report.failures().count(),
            abandoned = report.abandoned,
            "shutdown flush lost samples"
        );
    }

    Ok(())
}
