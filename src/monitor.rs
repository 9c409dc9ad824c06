use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::watch;

use crate::config::{AppConfig, FilteringConfig};
use crate::image_filter::ImageFilter;
use crate::listing_fetcher::{FetchFailureKind, ListingFetcher};
use crate::models::{
    load_queries_file, merge_queries, KnownProductRecord, ListingItem, NotificationBatch, SearchQuery,
};
use crate::notification_dispatcher::NotificationDispatcher;
use crate::product_store::{ProductStore, StoreStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    /// The query's own cadence has not elapsed yet.
    NotDue,
    NothingNew,
    Notified,
    NotificationFailed,
    FetchFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub query: String,
    pub status: QueryStatus,
    pub fetched: usize,
    pub passed_filters: usize,
    pub new_items: usize,
    pub committed: usize,
    pub failed_ids: Vec<String>,
    pub error: Option<String>,
}

impl QueryOutcome {
    fn new(query: &str, status: QueryStatus) -> Self {
        Self {
            query: query.to_string(),
            status,
            fetched: 0,
            passed_filters: 0,
            new_items: 0,
            committed: 0,
            failed_ids: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cleaned_up: usize,
    pub outcomes: Vec<QueryOutcome>,
    /// Set when a shutdown request stopped the cycle between queries.
    pub interrupted: bool,
    pub stats: StoreStats,
}

impl CycleReport {
    pub fn new_items(&self) -> usize {
        self.outcomes.iter().map(|o| o.new_items).sum()
    }

    pub fn committed(&self) -> usize {
        self.outcomes.iter().map(|o| o.committed).sum()
    }

    pub fn count(&self, status: QueryStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Drives fetch, filter, dedupe, notify and commit for every query in a tick.
///
/// Owns the store and the browser-backed fetcher exclusively. Items are only
/// committed after the channel confirmed the batch, so a failed send is
/// retried on the next tick.
pub struct MonitorOrchestrator {
    fetcher: ListingFetcher,
    store: ProductStore,
    image_filter: ImageFilter,
    dispatcher: NotificationDispatcher,
    filtering: FilteringConfig,
    exclude_keywords: Vec<String>,
    cleanup_after_days: u32,
    configured_queries: Vec<SearchQuery>,
    queries_file: Option<PathBuf>,
    queries: Vec<SearchQuery>,
    last_run: HashMap<String, DateTime<Utc>>,
}

impl MonitorOrchestrator {
    pub fn new(
        fetcher: ListingFetcher,
        store: ProductStore,
        image_filter: ImageFilter,
        dispatcher: NotificationDispatcher,
        config: &AppConfig,
        queries: Vec<SearchQuery>,
    ) -> Self {
        let exclude_keywords = config
            .filtering
            .exclude_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        Self {
            fetcher,
            store,
            image_filter,
            dispatcher,
            filtering: config.filtering.clone(),
            exclude_keywords,
            cleanup_after_days: config.storage.cleanup_after_days,
            configured_queries: queries.clone(),
            queries_file: None,
            queries,
            last_run: HashMap::new(),
        }
    }

    /// Re-reads `path` at the start of every cycle and merges it after the
    /// configured queries, so edits apply without a restart.
    pub fn with_queries_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.queries_file = Some(path.into());
        self
    }

    /// Rebuilds the query list from the queries file. On error the previous
    /// list is kept.
    pub fn reload_queries(&mut self) -> std::io::Result<usize> {
        let Some(path) = &self.queries_file else {
            return Ok(self.queries.len());
        };
        let from_file = load_queries_file(path)?;
        let queries = merge_queries(&self.configured_queries, from_file);
        if queries != self.queries {
            tracing::info!(path = %path.display(), count = queries.len(), "Search queries reloaded");
        }
        self.last_run.retain(|text, _| queries.iter().any(|q| &q.text == text));
        self.queries = queries;
        Ok(self.queries.len())
    }

    pub fn store(&self) -> &ProductStore {
        &self.store
    }

    pub fn queries(&self) -> &[SearchQuery] {
        &self.queries
    }

    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let started_at = Utc::now();
        tracing::info!(queries = self.queries.len(), "Starting monitoring cycle");

        let cleaned_up = match self.store.cleanup_older_than(self.cleanup_after_days) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(error = %e, "Store cleanup failed");
                0
            }
        };

        if let Err(e) = self.reload_queries() {
            tracing::warn!(error = %e, "Failed to re-read search queries; keeping previous list");
        }
        if self.queries.is_empty() {
            tracing::warn!("No search queries configured");
        }

        let mut outcomes = Vec::with_capacity(self.queries.len());
        let mut interrupted = false;
        let queries = self.queries.clone();
        for query in &queries {
            if *shutdown.borrow() {
                tracing::info!("Shutdown requested; stopping cycle before next query");
                interrupted = true;
                break;
            }

            let now = Utc::now();
            if !query.is_due(self.last_run.get(&query.text).copied(), now) {
                tracing::debug!(query = %query.text, "Query not due yet");
                outcomes.push(QueryOutcome::new(&query.text, QueryStatus::NotDue));
                continue;
            }

            let outcome = self.process_query(&query.text).await;
            // Failed work stays due so the next tick picks it up
            if matches!(outcome.status, QueryStatus::Notified | QueryStatus::NothingNew) {
                self.last_run.insert(query.text.clone(), now);
            } else {
                self.last_run.remove(&query.text);
            }
            outcomes.push(outcome);
        }

        let stats = self.store.stats();
        tracing::info!(
            total = stats.total,
            last_24h = stats.last_24h,
            last_7d = stats.last_7d,
            size_bytes = stats.size_bytes,
            "Product store stats"
        );

        let report = CycleReport {
            started_at,
            finished_at: Utc::now(),
            cleaned_up,
            outcomes,
            interrupted,
            stats,
        };
        tracing::info!(
            new_items = report.new_items(),
            committed = report.committed(),
            failed_fetches = report.count(QueryStatus::FetchFailed),
            failed_notifications = report.count(QueryStatus::NotificationFailed),
            "Monitoring cycle completed"
        );
        report
    }

    async fn process_query(&mut self, query: &str) -> QueryOutcome {
        let items = match self.fetcher.fetch(query).await {
            Ok(items) => items,
            Err(failure) => {
                match failure.kind {
                    FetchFailureKind::Terminal => tracing::warn!(
                        query,
                        attempts = failure.attempts,
                        snapshot = ?failure.snapshot,
                        error = %failure.message,
                        "Skipping query for this cycle"
                    ),
                    FetchFailureKind::Transient => tracing::warn!(
                        query,
                        attempts = failure.attempts,
                        error = %failure.message,
                        "Query fetch failed after retries; will try again next cycle"
                    ),
                }
                let mut outcome = QueryOutcome::new(query, QueryStatus::FetchFailed);
                outcome.error = Some(failure.to_string());
                return outcome;
            }
        };

        let mut outcome = QueryOutcome::new(query, QueryStatus::NothingNew);
        outcome.fetched = items.len();

        let survivors = self.apply_filters(items).await;
        outcome.passed_filters = survivors.len();

        let new_items: Vec<ListingItem> = survivors
            .into_iter()
            .filter(|item| self.store.is_new(&item.external_id))
            .collect();
        outcome.new_items = new_items.len();
        metrics::counter!("watcher_new_items_total").increment(new_items.len() as u64);

        if new_items.is_empty() {
            tracing::info!(query, fetched = outcome.fetched, "No new products");
            return outcome;
        }

        tracing::info!(query, count = new_items.len(), "Found new products");
        let batch = NotificationBatch::new(query, new_items);
        let dispatch = self.dispatcher.dispatch(&batch).await;

        if dispatch.sent {
            outcome.status = QueryStatus::Notified;
            outcome.committed = self.commit(&batch.items);
        } else {
            outcome.status = QueryStatus::NotificationFailed;
            outcome.failed_ids = dispatch.failed_ids;
            outcome.error = dispatch.error;
        }
        outcome
    }

    /// Price, then keyword, then image. Each stage only sees the previous stage's survivors.
    async fn apply_filters(&self, items: Vec<ListingItem>) -> Vec<ListingItem> {
        let mut survivors = Vec::with_capacity(items.len());
        for item in items {
            if !self.passes_price(&item) {
                tracing::debug!(id = %item.external_id, price = item.price_jpy, "Filtered by price");
                continue;
            }
            if !self.passes_keywords(&item) {
                tracing::debug!(id = %item.external_id, "Filtered by keyword");
                continue;
            }
            if !self.image_filter.passes(item.image_url.as_deref()).await {
                tracing::debug!(id = %item.external_id, "Filtered by image");
                continue;
            }
            survivors.push(item);
        }
        survivors
    }

    pub fn passes_price(&self, item: &ListingItem) -> bool {
        (self.filtering.min_price_jpy..=self.filtering.max_price_jpy).contains(&item.price_jpy)
    }

    pub fn passes_keywords(&self, item: &ListingItem) -> bool {
        let title = item.title.to_lowercase();
        !self.exclude_keywords.iter().any(|k| title.contains(k.as_str()))
    }

    fn commit(&mut self, items: &[ListingItem]) -> usize {
        let now = Utc::now();
        let mut committed = 0;
        for item in items {
            match self.store.record_seen(KnownProductRecord::from_item(item, now)) {
                Ok(true) => committed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(id = %item.external_id, error = %e, "Failed to record product");
                }
            }
        }
        committed
    }

    pub async fn shutdown(&self) {
        self.fetcher.shutdown().await;
    }
}
