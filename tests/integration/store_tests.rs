use chrono::{Duration, Utc};
use tokio::sync::watch;

use mercari_watcher::models::KnownProductRecord;
use mercari_watcher::product_store::ProductStore;

use super::*;

fn record(id: &str, days_ago: i64) -> KnownProductRecord {
    KnownProductRecord {
        external_id: id.to_string(),
        title: format!("Item {}", id),
        price_jpy: 1000,
        url: format!("https://jp.mercari.com/item/{}", id),
        first_seen_at: Utc::now() - Duration::days(days_ago),
        query: "switch".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_known_items_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("known.json");
    let config = get_test_config(&store_path);
    let page = results_page(&[("m1", "Switch OLED", 32800)]);
    let (_tx, rx) = watch::channel(false);

    {
        let source = StubSource::new().page("switch", page.clone());
        let mut monitor = build_monitor(&config, source, RecordingNotifier::new(), &["switch"]);
        monitor.run_cycle(&rx).await;
    }

    // A fresh process sees the same page and stays quiet
    let source = StubSource::new().page("switch", page);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    assert_eq!(monitor.store().len(), 1);

    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.new_items(), 0);
    assert!(notifier.sent_texts().is_empty());
}

#[test]
fn test_state_file_is_flat_id_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known.json");
    let mut store = ProductStore::open(&path, 10);
    store.record_seen(record("m1", 0)).unwrap();

    let state = read_state_file(&path);
    assert_eq!(state.len(), 1);
    let entry = &state["m1"];
    assert_eq!(entry["external_id"], "m1");
    assert_eq!(entry["price_jpy"], 1000);
    assert!(entry["first_seen_at"].is_string());
}

#[test]
fn test_capacity_keeps_newest_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known.json");
    let mut store = ProductStore::open(&path, 3);

    for (id, days_ago) in [("m1", 5), ("m2", 1), ("m3", 4), ("m4", 2), ("m5", 3)] {
        store.record_seen(record(id, days_ago)).unwrap();
        assert!(store.len() <= 3);
    }

    assert!(store.is_new("m1"));
    assert!(store.is_new("m3"));
    for id in ["m2", "m4", "m5"] {
        assert!(!store.is_new(id));
    }
    assert_eq!(read_state_file(&path).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_cleans_up_old_records_first() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("known.json");
    let config = get_test_config(&store_path);
    {
        let mut store = ProductStore::open(&store_path, 100);
        store.record_seen(record("m1", 10)).unwrap();
        store.record_seen(record("m2", 2)).unwrap();
    }

    // m1 expired, so seeing it again counts as new
    let source = StubSource::new().page("switch", results_page(&[("m1", "Switch OLED", 32800)]));
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(&config, source, notifier.clone(), &["switch"]);
    let (_tx, rx) = watch::channel(false);

    let report = monitor.run_cycle(&rx).await;
    assert_eq!(report.cleaned_up, 1);
    assert_eq!(report.new_items(), 1);
    assert_eq!(report.stats.total, 2);
    assert_eq!(report.stats.last_24h, 1);
}

#[test]
fn test_corrupt_state_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known.json");
    std::fs::write(&path, "{\"m1\": {\"external_id\": ").unwrap();

    let mut store = ProductStore::open(&path, 10);
    assert!(store.is_empty());

    store.record_seen(record("m2", 0)).unwrap();
    let reopened = ProductStore::open(&path, 10);
    assert_eq!(reopened.len(), 1);
    assert!(!reopened.is_new("m2"));
}
