use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;

use mercari_watcher::scheduler::MonitorScheduler;

use super::*;

#[tokio::test(start_paused = true)]
async fn test_scheduler_runs_until_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let config = get_test_config(&dir.path().join("known.json"));
    let source = StubSource::new()
        .page("switch", results_page(&[("m1", "Switch OLED", 32800)]))
        .page("switch", results_page(&[("m1", "Switch OLED", 32800), ("m2", "Switch Lite", 15000)]));
    let calls = source.calls.clone();
    let shutdowns = source.shutdowns.clone();
    let notifier = RecordingNotifier::new();
    let monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    let mut scheduler = MonitorScheduler::from_minutes(monitor, 10);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        scheduler.run_forever(rx).await;
        scheduler
    });

    // Ticks at 0, 10 and 20 minutes
    tokio::time::sleep(Duration::from_secs(25 * 60)).await;
    tx.send(true).unwrap();
    let scheduler = handle.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.stats().completed_cycles, 3);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    // m1 on the first tick, m2 on the second, nothing on the third
    assert_eq!(notifier.sent_texts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_cycle_defers_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = get_test_config(&dir.path().join("known.json"));
    config.timing.retry_delay = 60.0;
    // Two timeouts cost 60s + 120s of backoff, longer than the one-minute interval
    let source = StubSource::new()
        .error("switch", mercari_watcher::plugins::traits::SourceErrorKind::Timeout)
        .error("switch", mercari_watcher::plugins::traits::SourceErrorKind::Timeout)
        .page("switch", EMPTY_PAGE);
    let calls = source.calls.clone();
    let monitor = build_monitor(&config, source, RecordingNotifier::new(), &["switch"]);
    let mut scheduler = MonitorScheduler::from_minutes(monitor, 1);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        scheduler.run_forever(rx).await;
        scheduler
    });

    tokio::time::sleep(Duration::from_secs(200)).await;
    tx.send(true).unwrap();
    let scheduler = handle.await.unwrap();

    // First cycle ends at 180s; the delayed tick fires right after, then the next at 240s
    assert_eq!(scheduler.stats().completed_cycles, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}
