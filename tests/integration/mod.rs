// Integration tests for Mercari Watcher
// These tests drive the whole monitoring pipeline through stub collaborators

pub mod pipeline_tests;
pub mod scheduler_tests;
pub mod store_tests;

use async_trait::async_trait;
use image::RgbImage;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mercari_watcher::image_filter::{ImageFilter, ImageLoader};
use mercari_watcher::listing_fetcher::ListingFetcher;
use mercari_watcher::models::SearchQuery;
use mercari_watcher::monitor::MonitorOrchestrator;
use mercari_watcher::notification_dispatcher::NotificationDispatcher;
use mercari_watcher::plugins::traits::{
    ListingSource, NotificationReceipt, NotifierPlugin, OutboundMessage, PageSnapshot, SourceError,
    SourceErrorKind,
};
use mercari_watcher::plugins::FixedRateConverter;
use mercari_watcher::product_store::ProductStore;
use mercari_watcher::{AppConfig, AppError};

/// Test configuration: no pacing delays, price window 100..=50,000 yen
pub fn get_test_config(store_path: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.timing.search_delay = 0.0;
    config.timing.page_transition_delay = 0.0;
    config.timing.retry_delay = 5.0;
    config.timing.max_retries = 3;
    config.notifications.rate_limit_delay = 0.0;
    config.notifications.telegram.bot_token = Some("test-token".to_string());
    config.notifications.telegram.chat_id = Some("42".to_string());
    config.filtering.min_price_jpy = 100;
    config.filtering.max_price_jpy = 50_000;
    config.storage.path = store_path.to_path_buf();
    config.storage.max_products_to_remember = 100;
    config.monitor.queries_file = None;
    config
}

/// Renders a search result page the default selectors understand.
pub fn results_page(items: &[(&str, &str, u64)]) -> String {
    let cells: String = items
        .iter()
        .map(|(id, title, price)| {
            format!(
                r#"<li data-testid="item-cell">
                     <a data-testid="thumbnail-link" href="/item/{}">
                       <img src="https://static.mercdn.net/thumb/{}_1.jpg" />
                       <span data-testid="thumbnail-item-name">{}</span>
                       <span class="item-price">¥{}</span>
                     </a>
                   </li>"#,
                id, id, title, price
            )
        })
        .collect();
    format!("<html><body><ul>{}</ul></body></html>", cells)
}

pub const EMPTY_PAGE: &str =
    r#"<html><body><div data-testid="search-result-empty">該当する商品が見つかりません</div></body></html>"#;
pub const BLOCK_PAGE: &str =
    r#"<html><body><iframe src="https://captcha.example/challenge"></iframe></body></html>"#;

type Scripted = Result<String, SourceErrorKind>;

/// Serves pre-scripted pages per query. Once a query's script runs out, its
/// last response repeats; unknown queries get the empty-result page.
#[derive(Clone, Default)]
pub struct StubSource {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Scripted>>>>,
    last: Arc<Mutex<HashMap<String, Scripted>>>,
    pub calls: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, query: &str, html: impl Into<String>) -> Self {
        self.push(query, Ok(html.into()))
    }

    pub fn error(self, query: &str, kind: SourceErrorKind) -> Self {
        self.push(query, Err(kind))
    }

    fn push(self, query: &str, response: Scripted) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(query.to_string())
            .or_default()
            .push_back(response);
        self
    }

    fn next(&self, query: &str) -> Scripted {
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(query)
            .and_then(|script| script.pop_front());
        let mut last = self.last.lock().unwrap();
        match next {
            Some(response) => {
                last.insert(query.to_string(), response.clone());
                response
            }
            None => last
                .get(query)
                .cloned()
                .unwrap_or_else(|| Ok(EMPTY_PAGE.to_string())),
        }
    }
}

#[async_trait]
impl ListingSource for StubSource {
    async fn fetch_listing_snapshot(&self, query: &str) -> Result<PageSnapshot, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next(query) {
            Ok(html) => Ok(PageSnapshot {
                html,
                final_url: format!("https://jp.mercari.com/search?keyword={}", query),
            }),
            Err(kind) => Err(SourceError::new(kind, "scripted failure")),
        }
    }

    async fn capture_diagnostics(&self, label: &str) -> Option<PathBuf> {
        Some(PathBuf::from(format!("screenshots/{}.png", label)))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every outbound message. Fails while `failing` is set, or for
/// messages mentioning `fail_for_query`.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<OutboundMessage>>>,
    pub attempts: Arc<AtomicUsize>,
    pub failing: Arc<AtomicBool>,
    pub fail_for_query: Option<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }
}

#[async_trait]
impl NotifierPlugin for RecordingNotifier {
    fn name(&self) -> &str {
        "Recording Notifier"
    }

    fn plugin_type(&self) -> &str {
        "recording"
    }

    async fn send_message(&self, message: &OutboundMessage) -> mercari_watcher::Result<NotificationReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let targeted = self
            .fail_for_query
            .as_ref()
            .is_some_and(|q| message.text.contains(&format!("`{}`", q)));
        if self.failing.load(Ordering::SeqCst) || targeted {
            return Err(AppError::Notification {
                channel: "recording".to_string(),
                message: "channel unavailable".to_string(),
            });
        }

        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(NotificationReceipt {
            message_ids: vec![sent.len() as i64],
        })
    }

    async fn test_connection(&self) -> mercari_watcher::Result<bool> {
        Ok(true)
    }
}

/// Image loader that must never be reached when the background filter is off.
pub struct UnreachableImages;

#[async_trait]
impl ImageLoader for UnreachableImages {
    async fn load(&self, url: &str) -> mercari_watcher::Result<RgbImage> {
        Err(AppError::ImageUnavailable(format!("unexpected download of {}", url)))
    }
}

pub fn build_monitor(
    config: &AppConfig,
    source: StubSource,
    notifier: RecordingNotifier,
    queries: &[&str],
) -> MonitorOrchestrator {
    let fetcher = ListingFetcher::new(Box::new(source), config).unwrap();
    let store = ProductStore::open(&config.storage.path, config.storage.max_products_to_remember);
    let image_filter = ImageFilter::new(&config.filtering, Box::new(UnreachableImages));
    let dispatcher = NotificationDispatcher::new(
        Box::new(notifier),
        Box::new(FixedRateConverter::new(config.notifications.jpy_to_eur_rate)),
        &config.notifications,
    );

    MonitorOrchestrator::new(
        fetcher,
        store,
        image_filter,
        dispatcher,
        config,
        queries.iter().map(|q| SearchQuery::new(*q)).collect(),
    )
}

/// Reads the persisted state file as `id -> record` JSON.
pub fn read_state_file(path: &Path) -> serde_json::Map<String, serde_json::Value> {
    let bytes = std::fs::read(path).unwrap();
    match serde_json::from_slice(&bytes).unwrap() {
        serde_json::Value::Object(map) => map,
        other => panic!("state file is not a JSON object: {}", other),
    }
}
