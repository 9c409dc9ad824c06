use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;

use mercari_watcher::models::KnownProductRecord;
use mercari_watcher::monitor::QueryStatus;
use mercari_watcher::plugins::traits::SourceErrorKind;
use mercari_watcher::product_store::ProductStore;

use super::*;

fn known(id: &str, price: u64) -> KnownProductRecord {
    KnownProductRecord {
        external_id: id.to_string(),
        title: format!("Known {}", id),
        price_jpy: price,
        url: format!("https://jp.mercari.com/item/{}", id),
        first_seen_at: chrono::Utc::now(),
        query: "switch".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_price_window_and_known_items() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("known.json");
    let config = get_test_config(&store_path);
    {
        let mut store = ProductStore::open(&store_path, 100);
        store.record_seen(known("m3", 500)).unwrap();
    }

    let page = results_page(&[
        ("m1", "Nintendo Switch OLED", 32800),
        ("m2", "Switch + 10 games", 89800),
        ("m3", "Switch case", 500),
    ]);
    let source = StubSource::new().page("switch", page);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    let (_tx, rx) = watch::channel(false);

    let report = monitor.run_cycle(&rx).await;
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.passed_filters, 2);
    assert_eq!(outcome.new_items, 1);
    assert_eq!(outcome.status, QueryStatus::Notified);

    let texts = notifier.sent_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("Nintendo Switch OLED"));
    assert!(texts[0].contains("¥32,800 \\(\\~€209\\.92\\)"));

    let state = read_state_file(&store_path);
    let mut ids: Vec<&String> = state.keys().collect();
    ids.sort();
    assert_eq!(ids, vec!["m1", "m3"]);

    // Identical results on the next tick produce nothing to send
    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.outcomes[0].new_items, 0);
    assert_eq!(report.outcomes[0].status, QueryStatus::NothingNew);
    assert_eq!(notifier.sent_texts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_committed_ids_are_never_notified_again() {
    let dir = tempfile::tempdir().unwrap();
    let config = get_test_config(&dir.path().join("known.json"));
    let source = StubSource::new()
        .page("switch", results_page(&[("m1", "A", 1000), ("m2", "B", 2000)]))
        .page("switch", results_page(&[("m2", "B", 2000), ("m3", "C", 3000)]))
        .page("switch", results_page(&[("m1", "A", 900), ("m3", "C", 3000), ("m4", "D", 4000)]));
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    let (_tx, rx) = watch::channel(false);

    let new_per_cycle: Vec<usize> = {
        let mut counts = Vec::new();
        for _ in 0..4 {
            counts.push(monitor.run_cycle(&rx).await.new_items());
        }
        counts
    };
    assert_eq!(new_per_cycle, vec![2, 1, 1, 0]);

    let texts = notifier.sent_texts();
    assert_eq!(texts.len(), 3);
    assert!(texts[1].contains("*C*"));
    assert!(!texts[1].contains("*B*"));
    assert!(texts[2].contains("*D*"));
    assert!(!texts[2].contains("*A*"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_is_retried_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("known.json");
    let config = get_test_config(&store_path);
    let source = StubSource::new().page("switch", results_page(&[("m1", "Switch OLED", 32800)]));
    let notifier = RecordingNotifier::new();
    notifier.failing.store(true, Ordering::SeqCst);
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    let (_tx, rx) = watch::channel(false);

    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.outcomes[0].status, QueryStatus::NotificationFailed);
    assert_eq!(report.outcomes[0].failed_ids, vec!["m1"]);
    assert!(monitor.store().is_new("m1"));
    assert!(!store_path.exists());

    notifier.failing.store(false, Ordering::SeqCst);
    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.outcomes[0].status, QueryStatus::Notified);
    assert_eq!(report.committed(), 1);
    assert!(!monitor.store().is_new("m1"));
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_does_not_block_other_queries() {
    let dir = tempfile::tempdir().unwrap();
    let config = get_test_config(&dir.path().join("known.json"));
    let source = StubSource::new()
        .page("pokemon card", results_page(&[("m10", "Pikachu", 1200)]))
        .page("switch", results_page(&[("m20", "Switch Lite", 15000)]));
    let notifier = RecordingNotifier {
        fail_for_query: Some("pokemon card".to_string()),
        ..RecordingNotifier::new()
    };
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["pokemon card", "switch"]);
    let (_tx, rx) = watch::channel(false);

    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.outcomes[0].status, QueryStatus::NotificationFailed);
    assert_eq!(report.outcomes[1].status, QueryStatus::Notified);
    assert!(monitor.store().is_new("m10"));
    assert!(!monitor.store().is_new("m20"));
}

#[tokio::test(start_paused = true)]
async fn test_blocked_query_is_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = get_test_config(&dir.path().join("known.json"));
    let source = StubSource::new()
        .page("blocked", BLOCK_PAGE)
        .page("switch", results_page(&[("m1", "Switch OLED", 32800)]));
    let calls = source.calls.clone();
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["blocked", "switch"]);
    let (_tx, rx) = watch::channel(false);

    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.outcomes[0].status, QueryStatus::FetchFailed);
    assert!(report.outcomes[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("block")));
    assert_eq!(report.outcomes[1].status, QueryStatus::Notified);
    // One attempt for the blocked page, one for the good query
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(notifier.sent_texts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_within_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = get_test_config(&dir.path().join("known.json"));
    let source = StubSource::new()
        .error("switch", SourceErrorKind::Timeout)
        .error("switch", SourceErrorKind::Network)
        .page("switch", results_page(&[("m1", "Switch OLED", 32800)]));
    let calls = source.calls.clone();
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    let (_tx, rx) = watch::channel(false);

    let start = tokio::time::Instant::now();
    let report = monitor.run_cycle(&rx).await;

    // Backoff of 5s then 10s
    assert!(start.elapsed() >= Duration::from_secs(15));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.outcomes[0].status, QueryStatus::Notified);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_leave_query_for_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let config = get_test_config(&dir.path().join("known.json"));
    let source = StubSource::new()
        .error("switch", SourceErrorKind::Timeout)
        .error("switch", SourceErrorKind::Timeout)
        .error("switch", SourceErrorKind::Timeout)
        .page("switch", results_page(&[("m1", "Switch OLED", 32800)]));
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    let (_tx, rx) = watch::channel(false);

    let first = monitor.run_cycle(&rx).await;
    assert_eq!(first.outcomes[0].status, QueryStatus::FetchFailed);

    let second = monitor.run_cycle(&rx).await;
    assert_eq!(second.outcomes[0].status, QueryStatus::Notified);
}

#[tokio::test(start_paused = true)]
async fn test_item_seen_by_two_queries_is_sent_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = get_test_config(&dir.path().join("known.json"));
    let shared = results_page(&[("m7", "Switch Pokemon Edition", 30000)]);
    let source = StubSource::new().page("switch", shared.clone()).page("pokemon", shared);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch", "pokemon"]);
    let (_tx, rx) = watch::channel(false);

    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.outcomes[0].status, QueryStatus::Notified);
    assert_eq!(report.outcomes[1].status, QueryStatus::NothingNew);
    assert_eq!(notifier.sent_texts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_large_batch_is_condensed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = get_test_config(&dir.path().join("known.json"));
    config.notifications.max_images_per_notification = 3;
    let items: Vec<(String, String, u64)> = (1..=5)
        .map(|i| (format!("m{}", i), format!("Card {}", i), 1000 * i))
        .collect();
    let borrowed: Vec<(&str, &str, u64)> = items
        .iter()
        .map(|(id, title, price)| (id.as_str(), title.as_str(), *price))
        .collect();
    let source = StubSource::new().page("cards", results_page(&borrowed));
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["cards"]);
    let (_tx, rx) = watch::channel(false);

    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.committed(), 5);

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].images.len(), 3);
    assert!(sent[0].text.contains("*5 New Products Found*"));
    assert!(sent[0].text.contains("\\.\\.\\.and 2 more"));
}
