use super::*;
use crate::buffer::{SampleBuffer, SampleFlusher};
use crate::test_support::{t0, MemorySampleStore};
use chrono::Duration as ChronoDuration;

fn fill(buffer: &SampleBuffer, kind: Kind, count: i64) {
    for i in 0..count {
        buffer.add(Sample::measured(
            kind,
            t0() + ChronoDuration::seconds(i),
            i as f64,
        ));
    }
}

fn coordinator_with(buffer: &SampleBuffer, store: Arc<MemorySampleStore>) -> FlushCoordinator {
    let coordinator = FlushCoordinator::new(Duration::from_millis(500));
    coordinator.register("meter", Arc::new(SampleFlusher::new(buffer.clone(), store)));
    coordinator
}

fn outcome_for(report: &FlushReport, kind: Kind) -> &FlushOutcome {
    &report
        .entries
        .iter()
        .find(|entry| entry.kind == kind)
        .expect("entry for kind")
        .outcome
}

#[tokio::test]
async fn shutdown_flushes_every_kind_even_when_one_fails() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    store.fail_kind(Kind::Power);
    fill(&buffer, Kind::Power, 3);
    fill(&buffer, Kind::ImportedEnergy, 4);
    fill(&buffer, Kind::Voltage, 2);

    let coordinator = coordinator_with(&buffer, store.clone());
    let report = coordinator
        .on_stop(Duration::from_secs(5), CancellationToken::new())
        .await;

    assert_eq!(report.mode, FlushMode::Shutdown);
    assert_eq!(report.entries.len(), 3);
    assert!(matches!(outcome_for(&report, Kind::Power), FlushOutcome::Dropped(_)));
    assert_eq!(
        outcome_for(&report, Kind::ImportedEnergy),
        &FlushOutcome::Persisted { inserted: 4 }
    );
    assert_eq!(
        outcome_for(&report, Kind::Voltage),
        &FlushOutcome::Persisted { inserted: 2 }
    );
    assert_eq!(report.persisted_samples(), 6);
    assert!(!report.is_clean());

    // No retries at shutdown: the failed batch is gone rather than requeued.
    assert!(buffer.is_empty());
    assert_eq!(store.rows(Kind::ImportedEnergy).len(), 4);
    assert!(store.rows(Kind::Power).is_empty());
    assert!(coordinator.stats().last_error().is_some());
    assert_eq!(coordinator.state(), FlushState::Idle);
}

#[tokio::test]
async fn periodic_failure_requeues_and_the_next_cycle_retries() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    store.fail_kind(Kind::Current);
    fill(&buffer, Kind::Current, 5);
    fill(&buffer, Kind::Power, 1);

    let coordinator = coordinator_with(&buffer, store.clone());
    let first = coordinator.flush_now(FlushMode::Periodic).await;
    assert!(matches!(outcome_for(&first, Kind::Current), FlushOutcome::Requeued(_)));
    assert!(outcome_for(&first, Kind::Power).is_success());
    assert_eq!(buffer.drain(Kind::Current).len(), 5);

    fill(&buffer, Kind::Current, 5);
    store.heal_kind(Kind::Current);
    let second = coordinator.flush_now(FlushMode::Periodic).await;
    assert!(second.is_clean());
    assert_eq!(store.rows(Kind::Current).len(), 5);
    assert!(buffer.is_empty());
    assert_eq!(coordinator.stats().last_error(), None);
}

#[tokio::test]
async fn requeued_batch_keeps_its_place_ahead_of_new_samples() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    store.fail_kind(Kind::Power);
    fill(&buffer, Kind::Power, 2);

    let coordinator = coordinator_with(&buffer, store.clone());
    coordinator.flush_now(FlushMode::Periodic).await;
    buffer.add(Sample::measured(
        Kind::Power,
        t0() + ChronoDuration::minutes(5),
        99.0,
    ));

    let values: Vec<f64> = buffer
        .drain(Kind::Power)
        .iter()
        .map(|sample| sample.value)
        .collect();
    assert_eq!(values, vec![0.0, 1.0, 99.0]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_persists_that_outlive_the_grace_period() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    store.hang_kind(Kind::Voltage);
    fill(&buffer, Kind::Voltage, 3);
    fill(&buffer, Kind::ExportedEnergy, 3);

    let coordinator = coordinator_with(&buffer, store.clone());
    let started = Instant::now();
    let report = coordinator
        .on_stop(Duration::from_secs(5), CancellationToken::new())
        .await;

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(outcome_for(&report, Kind::Voltage), &FlushOutcome::TimedOut);
    assert!(outcome_for(&report, Kind::ExportedEnergy).is_success());
    assert_eq!(store.rows(Kind::ExportedEnergy).len(), 3);
    assert_eq!(coordinator.stats().inflight_persists.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn host_cancellation_cuts_the_grace_period_short() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    store.hang_kind(Kind::Power);
    fill(&buffer, Kind::Power, 1);

    let coordinator = coordinator_with(&buffer, store);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = coordinator.on_stop(Duration::from_secs(60), cancel).await;
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(outcome_for(&report, Kind::Power), &FlushOutcome::TimedOut);
}

#[derive(Default)]
struct PanickingSource {
    requeued: Mutex<Vec<Batch>>,
}

#[async_trait]
impl Flushable for PanickingSource {
    fn drain(&self) -> Vec<Batch> {
        vec![Batch {
            kind: Kind::Current,
            samples: vec![Sample::measured(Kind::Current, t0(), 16.0)],
        }]
    }

    async fn persist(&self, _batch: &Batch) -> Result<u64, TelemetryError> {
        panic!("driver crashed");
    }

    fn requeue(&self, batch: Batch) {
        self.requeued.lock().unwrap().push(batch);
    }
}

#[tokio::test]
async fn a_panicking_source_is_isolated_from_the_others() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    fill(&buffer, Kind::Power, 2);

    let coordinator = coordinator_with(&buffer, store.clone());
    let broken_source = Arc::new(PanickingSource::default());
    coordinator.register("broken", broken_source.clone());
    assert_eq!(coordinator.source_names(), vec!["meter", "broken"]);

    let report = coordinator
        .on_stop(Duration::from_secs(5), CancellationToken::new())
        .await;
    let broken = report
        .entries
        .iter()
        .find(|entry| entry.source == "broken")
        .expect("broken entry");
    assert!(matches!(broken.outcome, FlushOutcome::Dropped(_)));
    assert!(broken_source.requeued.lock().unwrap().is_empty());
    assert_eq!(store.rows(Kind::Power).len(), 2);
}

#[tokio::test]
async fn periodic_panic_requeues_the_batch() {
    let coordinator = FlushCoordinator::new(Duration::from_millis(500));
    let source = Arc::new(PanickingSource::default());
    coordinator.register("broken", source.clone());

    let report = coordinator.flush_now(FlushMode::Periodic).await;
    assert!(matches!(report.entries[0].outcome, FlushOutcome::Requeued(_)));

    let requeued = source.requeued.lock().unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].kind, Kind::Current);
    assert_eq!(requeued[0].samples.len(), 1);
}

#[tokio::test]
async fn empty_cycle_reports_nothing_and_stays_idle() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    let coordinator = coordinator_with(&buffer, store.clone());
    coordinator.on_start();

    let report = coordinator.flush_now(FlushMode::Periodic).await;
    assert!(report.entries.is_empty());
    assert!(report.is_clean());
    assert_eq!(coordinator.state(), FlushState::Idle);
    assert_eq!(store.append_calls.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduled_loop_flushes_until_cancelled() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    let coordinator = Arc::new(coordinator_with(&buffer, store.clone()));
    let cancel = CancellationToken::new();
    let handle = coordinator.clone().start(cancel.clone());

    fill(&buffer, Kind::Power, 3);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(store.rows(Kind::Power).len(), 3);
    assert!(buffer.is_empty());

    cancel.cancel();
    handle.await.unwrap();

    fill(&buffer, Kind::Power, 1);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(buffer.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_loop_interrupts_a_hung_cycle_and_keeps_its_batch() {
    let buffer = SampleBuffer::new();
    let store = Arc::new(MemorySampleStore::new());
    store.hang_kind(Kind::Power);
    fill(&buffer, Kind::Power, 1);

    let coordinator = Arc::new(coordinator_with(&buffer, store.clone()));
    let cancel = CancellationToken::new();
    let handle = coordinator.clone().start(cancel.clone());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.state(), FlushState::Persisting);
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("flush loop stops promptly after cancel")
        .unwrap();
    assert_eq!(coordinator.state(), FlushState::Idle);
    assert_eq!(buffer.len(), 1);

    store.release_kind(Kind::Power);
    let report = coordinator
        .on_stop(Duration::from_secs(5), CancellationToken::new())
        .await;
    assert!(report.is_clean());
    assert_eq!(store.rows(Kind::Power).len(), 1);
}
