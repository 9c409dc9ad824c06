use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_retry::RetryIf;
use url::Url;

use crate::config::{AppConfig, SelectorConfig, SourceConfig};
use crate::models::ListingItem;
use crate::plugins::traits::{ListingSource, SourceError};
use crate::utils::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchFailureKind {
    /// Timeouts or network errors that outlasted every retry.
    Transient,
    /// Hard block, or the page layout never matched the selectors.
    Terminal,
}

#[derive(Error, Debug, Clone)]
#[error("fetch failed ({kind:?}) after {attempts} attempt(s): {message}")]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub message: String,
    pub attempts: u32,
    /// Screenshot of the page at failure time, if one could be taken.
    pub snapshot: Option<PathBuf>,
}

/// What a rendered search page turned out to contain.
#[derive(Debug, Clone, PartialEq)]
pub enum PageClassification {
    Listings(Vec<ListingItem>),
    NoResults,
    Blocked,
    LayoutMismatch,
}

/// Turns search result HTML into listing items using the configured selectors.
pub struct ListingParser {
    listings: Selector,
    item_url: Selector,
    item_title: Selector,
    item_price: Selector,
    item_image: Selector,
    no_results: Selector,
    block_indicator: Option<Selector>,
    id_pattern: Regex,
    base_url: Url,
}

impl ListingParser {
    pub fn new(selectors: &SelectorConfig, source: &SourceConfig) -> Result<Self, AppError> {
        let parse = |name: &str, selector: &str| {
            Selector::parse(selector).map_err(|e| {
                AppError::Validation(format!("Invalid CSS selector '{}' for {}: {:?}", selector, name, e))
            })
        };

        let block_indicator = block_selector(selectors)
            .map(|selector| parse("block_indicator", &selector))
            .transpose()?;

        Ok(Self {
            listings: parse("listings", &selectors.listings)?,
            item_url: parse("item_url", &selectors.item_url)?,
            item_title: parse("item_title", &selectors.item_title)?,
            item_price: parse("item_price", &selectors.item_price)?,
            item_image: parse("item_image", &selectors.item_image)?,
            no_results: parse("no_results", &selectors.no_results)?,
            block_indicator,
            id_pattern: Regex::new(&source.item_id_pattern)
                .map_err(|e| AppError::Validation(format!("Invalid item_id_pattern: {}", e)))?,
            base_url: Url::parse(&source.search_url)
                .map_err(|e| AppError::Validation(format!("Invalid search URL: {}", e)))?,
        })
    }

    pub fn classify(&self, html: &str, query: &str, observed_at: DateTime<Utc>) -> PageClassification {
        let document = Html::parse_document(html);

        if let Some(block) = &self.block_indicator {
            if document.select(block).next().is_some() {
                return PageClassification::Blocked;
            }
        }

        let cells: Vec<ElementRef> = document.select(&self.listings).collect();
        if cells.is_empty() {
            if document.select(&self.no_results).next().is_some() {
                return PageClassification::NoResults;
            }
            return PageClassification::LayoutMismatch;
        }

        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(cells.len());
        for cell in &cells {
            match self.parse_cell(cell, query, observed_at) {
                Some(item) => {
                    if seen.insert(item.external_id.clone()) {
                        items.push(item);
                    }
                }
                None => tracing::debug!("Skipping listing cell without id or url"),
            }
        }

        if items.is_empty() {
            tracing::warn!(
                cells = cells.len(),
                query,
                "Listing cells found but none could be parsed; item selectors may be outdated"
            );
        }

        PageClassification::Listings(items)
    }

    fn parse_cell(&self, cell: &ElementRef, query: &str, observed_at: DateTime<Utc>) -> Option<ListingItem> {
        let href = cell
            .select(&self.item_url)
            .next()
            .and_then(|a| a.value().attr("href"))
            .or_else(|| cell.value().attr("href"))?;
        let url = self.base_url.join(href.trim()).ok()?.to_string();

        let external_id = self
            .id_pattern
            .captures(&url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())?;

        let title = cell
            .select(&self.item_title)
            .next()
            .map(|e| collapse_whitespace(&e.text().collect::<String>()))
            .unwrap_or_default();

        let price_jpy = cell
            .select(&self.item_price)
            .next()
            .map(|e| parse_price(&e.text().collect::<String>()))
            .unwrap_or(0);

        let image_url = cell.select(&self.item_image).next().and_then(|img| {
            img.value()
                .attr("src")
                .or_else(|| img.value().attr("data-src"))
                .and_then(|src| self.base_url.join(src.trim()).ok())
                .map(|u| u.to_string())
        });

        Some(ListingItem {
            external_id,
            title,
            price_jpy,
            url,
            image_url,
            query: query.to_string(),
            observed_at,
        })
    }
}

fn block_selector(selectors: &SelectorConfig) -> Option<String> {
    selectors
        .block_indicator
        .as_ref()
        .filter(|s| !s.trim().is_empty())
        .cloned()
}

/// Joins every digit in the text: `"¥1,234"` becomes 1234. No digits means 0.
pub fn parse_price(text: &str) -> u64 {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return 0;
    }
    digits.parse().unwrap_or_else(|_| {
        tracing::warn!(text, "Could not parse price");
        0
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Delay before each retry: `retry_delay * attempt` for attempts `1..max_attempts`.
pub fn backoff_schedule(retry_delay: Duration, max_attempts: u32) -> Vec<Duration> {
    (1..max_attempts.max(1)).map(|attempt| retry_delay * attempt).collect()
}

#[derive(Debug)]
enum AttemptError {
    Source(SourceError),
    LayoutMismatch,
    Blocked,
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Source(e) => e.is_transient(),
            AttemptError::LayoutMismatch => true,
            AttemptError::Blocked => false,
        }
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    fn retries_after(&self, attempt: u32, max_attempts: u32) -> bool {
        self.is_retryable() && attempt < max_attempts
    }

    fn describe(&self) -> String {
        match self {
            AttemptError::Source(e) => e.to_string(),
            AttemptError::LayoutMismatch => "no listing selector matched the page".to_string(),
            AttemptError::Blocked => "site returned a block page".to_string(),
        }
    }
}

/// Retrying, paced front-end over a `ListingSource`.
pub struct ListingFetcher {
    source: Box<dyn ListingSource>,
    parser: ListingParser,
    max_attempts: u32,
    retry_delay: Duration,
    search_delay: Duration,
    page_transition_delay: Duration,
    last_fetch: Option<Instant>,
}

impl ListingFetcher {
    pub fn new(source: Box<dyn ListingSource>, config: &AppConfig) -> Result<Self, AppError> {
        Ok(Self {
            source,
            parser: ListingParser::new(&config.selectors, &config.source)?,
            max_attempts: config.timing.max_retries.max(1),
            retry_delay: config.timing.retry_delay(),
            search_delay: config.timing.search_delay(),
            page_transition_delay: config.timing.page_transition_delay(),
            last_fetch: None,
        })
    }

    /// Fetches and parses the listings for `query`.
    ///
    /// An empty result page is `Ok(vec![])`. Timeouts, network errors and layout
    /// mismatches are retried with linear backoff; a block page fails at once.
    pub async fn fetch(&mut self, query: &str) -> Result<Vec<ListingItem>, FetchFailure> {
        self.pace().await;

        let attempts = AtomicU32::new(0);
        let result = {
            let this = &*self;
            let attempts = &attempts;
            RetryIf::start(
                backoff_schedule(this.retry_delay, this.max_attempts),
                move || async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt > 1 {
                        tokio::time::sleep(this.page_transition_delay).await;
                    }
                    this.attempt(query, attempt).await
                },
                |e: &AttemptError| {
                    let attempt = attempts.load(Ordering::SeqCst);
                    let retry = e.retries_after(attempt, this.max_attempts);
                    if retry {
                        tracing::warn!(
                            query,
                            attempt,
                            max_attempts = this.max_attempts,
                            error = %e.describe(),
                            "Fetch attempt failed; backing off"
                        );
                    }
                    retry
                },
            )
            .await
        };
        self.last_fetch = Some(Instant::now());

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(items) => {
                metrics::counter!("watcher_items_fetched_total").increment(items.len() as u64);
                Ok(items)
            }
            Err(e) => {
                let kind = match &e {
                    AttemptError::Source(source) if source.is_transient() => FetchFailureKind::Transient,
                    _ => FetchFailureKind::Terminal,
                };
                let label = format!("failure_{}", sanitize_label(query));
                let snapshot = self.source.capture_diagnostics(&label).await;
                let kind_label = match kind {
                    FetchFailureKind::Terminal => "terminal",
                    FetchFailureKind::Transient => "transient",
                };
                metrics::counter!("watcher_fetch_failures_total", "kind" => kind_label).increment(1);

                Err(FetchFailure {
                    kind,
                    message: e.describe(),
                    attempts,
                    snapshot,
                })
            }
        }
    }

    pub async fn shutdown(&self) {
        self.source.shutdown().await;
    }

    async fn attempt(&self, query: &str, attempt: u32) -> Result<Vec<ListingItem>, AttemptError> {
        tracing::debug!(query, attempt, "Fetching listings");
        let snapshot = self
            .source
            .fetch_listing_snapshot(query)
            .await
            .map_err(AttemptError::Source)?;

        match self.parser.classify(&snapshot.html, query, Utc::now()) {
            PageClassification::Listings(items) => {
                tracing::info!(query, count = items.len(), "Extracted listings");
                Ok(items)
            }
            PageClassification::NoResults => {
                tracing::info!(query, "No results for query");
                Ok(Vec::new())
            }
            PageClassification::Blocked => Err(AttemptError::Blocked),
            PageClassification::LayoutMismatch => Err(AttemptError::LayoutMismatch),
        }
    }

    async fn pace(&self) {
        if let Some(last) = self.last_fetch {
            let elapsed = last.elapsed();
            if elapsed < self.search_delay {
                tokio::time::sleep(self.search_delay - elapsed).await;
            }
        }
    }
}

fn sanitize_label(query: &str) -> String {
    query
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
