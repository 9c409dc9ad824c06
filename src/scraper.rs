use anyhow::anyhow;
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::config::{AppConfig, BrowserConfig};
use crate::plugins::traits::{ListingSource, PageSnapshot, SourceError, SourceErrorKind};
use crate::utils::error::AppError;

struct BrowserSession {
    // Kept alive for as long as the tab is in use; dropping it closes Chrome.
    _browser: Browser,
    tab: Arc<Tab>,
}

/// One long-lived Chrome session driving the marketplace search page.
pub struct WebScraper {
    config: BrowserConfig,
    search_url: Url,
    wait_selector: String,
    screenshot_dir: PathBuf,
    session: Mutex<Option<BrowserSession>>,
}

impl WebScraper {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let search_url = Url::parse(&config.source.search_url)
            .map_err(|e| AppError::Validation(format!("Invalid search URL: {}", e)))?;

        // Whichever renders first: the grid, the empty-result marker or a block page
        let mut wait_targets = vec![
            config.selectors.listings.clone(),
            config.selectors.no_results.clone(),
        ];
        if let Some(block) = &config.selectors.block_indicator {
            wait_targets.push(block.clone());
        }

        Ok(Self {
            config: config.browser.clone(),
            search_url,
            wait_selector: wait_targets.join(", "),
            screenshot_dir: config.screenshots.directory.clone(),
            session: Mutex::new(None),
        })
    }

    /// Launches the browser eagerly so startup fails fast when Chrome is missing.
    pub fn start(&self) -> Result<(), AppError> {
        self.tab()
            .map(|_| ())
            .map_err(|e| AppError::Scraping(e.message))
    }

    pub fn search_url_for(&self, query: &str) -> Url {
        let mut url = self.search_url.clone();
        url.query_pairs_mut().append_pair("keyword", query);
        url
    }

    fn launch(&self) -> anyhow::Result<BrowserSession> {
        let args: Vec<&OsStr> = self.config.extra_flags.iter().map(OsStr::new).collect();

        let mut launch_options = LaunchOptions::default_builder()
            .headless(self.config.headless)
            .sandbox(false)
            .window_size(Some((self.config.window_size.width, self.config.window_size.height)))
            .args(args)
            .idle_browser_timeout(Duration::from_secs(
                self.config.page_load_timeout.max(30) * 10,
            ))
            .build()
            .map_err(|e| anyhow!("Failed to create launch options: {}", e))?;

        if let Some(chrome_path) = &self.config.chrome_path {
            launch_options.path = Some(PathBuf::from(chrome_path));
        }

        tracing::info!(headless = self.config.headless, "Launching browser session");
        let browser = Browser::new(launch_options)
            .map_err(|e| anyhow!("Failed to launch browser: {}", e))?;
        let tab = browser
            .new_tab()
            .map_err(|e| anyhow!("Failed to create tab: {}", e))?;
        tab.set_default_timeout(Duration::from_secs(self.config.page_load_timeout));

        if let Some(user_agent) = &self.config.user_agent {
            tab.set_user_agent(user_agent, Some("ja-JP,ja;q=0.9"), None)
                .map_err(|e| anyhow!("Failed to set user agent: {}", e))?;
        }

        Ok(BrowserSession { _browser: browser, tab })
    }

    fn tab(&self) -> Result<Arc<Tab>, SourceError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| SourceError::new(SourceErrorKind::SessionLost, "browser session lock poisoned"))?;

        if session.is_none() {
            let fresh = self
                .launch()
                .map_err(|e| SourceError::new(SourceErrorKind::SessionLost, e.to_string()))?;
            *session = Some(fresh);
        }

        session
            .as_ref()
            .map(|s| Arc::clone(&s.tab))
            .ok_or_else(|| SourceError::new(SourceErrorKind::SessionLost, "no browser session"))
    }

    fn reset_session(&self) {
        if let Ok(mut session) = self.session.lock() {
            if session.take().is_some() {
                tracing::warn!("Browser session reset; a fresh one starts on the next fetch");
            }
        }
    }

    fn fail(&self, context: &str, error: anyhow::Error) -> SourceError {
        let kind = classify_browser_error(&error.to_string());
        if kind == SourceErrorKind::SessionLost {
            self.reset_session();
        }
        SourceError::new(kind, format!("{}: {}", context, error))
    }
}

#[async_trait]
impl ListingSource for WebScraper {
    async fn fetch_listing_snapshot(&self, query: &str) -> Result<PageSnapshot, SourceError> {
        let tab = self.tab()?;
        let url = self.search_url_for(query);
        tracing::info!(query, url = %url, "Searching");

        tab.navigate_to(url.as_str())
            .map_err(|e| self.fail("Navigation failed", e))?;
        tab.wait_until_navigated()
            .map_err(|e| self.fail("Page load failed", e))?;

        // A miss here is not fatal: the page content is classified by the caller
        let wait = Duration::from_secs(self.config.implicit_wait);
        if let Err(e) = tab.wait_for_element_with_custom_timeout(&self.wait_selector, wait) {
            tracing::debug!(query, error = %e, "Listing grid did not render in time");
        }

        let html = tab
            .get_content()
            .map_err(|e| self.fail("Failed to get page content", e))?;
        let final_url = {
            let current = tab.get_url();
            if current.is_empty() { url.to_string() } else { current }
        };

        Ok(PageSnapshot { html, final_url })
    }

    async fn capture_diagnostics(&self, label: &str) -> Option<PathBuf> {
        let tab = {
            let session = self.session.lock().ok()?;
            session.as_ref().map(|s| Arc::clone(&s.tab))
        };
        let Some(tab) = tab else {
            tracing::warn!("Cannot take screenshot, browser session is not active");
            return None;
        };

        let data = match tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Screenshot capture failed");
                return None;
            }
        };

        match write_screenshot(&self.screenshot_dir, label, &data) {
            Ok(path) => {
                tracing::info!(path = %path.display(), "Screenshot saved");
                Some(path)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to save screenshot");
                None
            }
        }
    }

    async fn shutdown(&self) {
        if let Ok(mut session) = self.session.lock() {
            if session.take().is_some() {
                tracing::info!("Browser session closed");
            }
        }
    }
}

fn classify_browser_error(message: &str) -> SourceErrorKind {
    let message = message.to_lowercase();
    if message.contains("timeout") || message.contains("timed out") {
        SourceErrorKind::Timeout
    } else if message.contains("connection is closed")
        || message.contains("disconnected")
        || message.contains("no browser")
        || message.contains("channel closed")
    {
        SourceErrorKind::SessionLost
    } else {
        SourceErrorKind::Network
    }
}

fn write_screenshot(dir: &Path, label: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let safe_label: String = label
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect();
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let filename = format!("{}_{}_{}.png", safe_label, timestamp, uuid::Uuid::new_v4().simple());
    let path = dir.join(filename);
    std::fs::write(&path, data)?;
    Ok(path)
}
