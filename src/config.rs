use config::{Config, ConfigError, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::models::SearchQuery;

pub const DEFAULT_CONFIG_PATH: &str = "config/default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub browser: BrowserConfig,
    pub selectors: SelectorConfig,
    pub source: SourceConfig,
    pub timing: TimingConfig,
    pub filtering: FilteringConfig,
    pub notifications: NotificationsConfig,
    pub storage: StorageConfig,
    pub monitor: MonitorConfig,
    pub screenshots: ScreenshotConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub window_size: WindowSize,
    /// Seconds allowed for a navigation to finish.
    pub page_load_timeout: u64,
    /// Seconds to wait for the listing grid (or the no-results marker) to render.
    pub implicit_wait: u64,
    pub extra_flags: Vec<String>,
    pub chrome_path: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// CSS selectors describing the search result page layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub listings: String,
    pub item_url: String,
    pub item_title: String,
    pub item_price: String,
    pub item_image: String,
    pub no_results: String,
    pub block_indicator: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub search_url: String,
    /// Regex applied to the item URL; the first capture group is the external id.
    pub item_id_pattern: String,
}

/// All delays are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub search_delay: f64,
    pub page_transition_delay: f64,
    pub retry_delay: f64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    pub min_price_jpy: u64,
    pub max_price_jpy: u64,
    pub exclude_keywords: Vec<String>,
    pub background_filter_enabled: bool,
    pub background_color_threshold: u8,
    pub max_solid_color_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub rate_limit_delay: f64,
    pub max_images_per_notification: usize,
    pub jpy_to_eur_rate: Option<f64>,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub max_products_to_remember: usize,
    pub cleanup_after_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_minutes: u64,
    pub queries: Vec<SearchQuery>,
    pub queries_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: WindowSize { width: 1920, height: 1080 },
            page_load_timeout: 30,
            implicit_wait: 10,
            extra_flags: vec![
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--disable-blink-features=AutomationControlled".to_string(),
            ],
            chrome_path: None,
            user_agent: None,
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            listings: r#"li[data-testid="item-cell"]"#.to_string(),
            item_url: r#"a[data-testid="thumbnail-link"]"#.to_string(),
            item_title: r#"[data-testid="thumbnail-item-name"]"#.to_string(),
            item_price: r#"[class*="price"]"#.to_string(),
            item_image: "img".to_string(),
            no_results: r#"[data-testid="search-result-empty"]"#.to_string(),
            block_indicator: Some(r#"iframe[src*="captcha"]"#.to_string()),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            search_url: "https://jp.mercari.com/search".to_string(),
            item_id_pattern: r"/item/(m\d+)".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            search_delay: 3.0,
            page_transition_delay: 2.0,
            retry_delay: 5.0,
            max_retries: 3,
        }
    }
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            min_price_jpy: 0,
            max_price_jpy: 1_000_000,
            exclude_keywords: Vec::new(),
            background_filter_enabled: false,
            background_color_threshold: 240,
            max_solid_color_ratio: 0.7,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            rate_limit_delay: 1.0,
            max_images_per_notification: 10,
            jpy_to_eur_rate: Some(0.0064),
            telegram: TelegramConfig::default(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base_url: "https://api.telegram.org".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mercari_known_products.json"),
            max_products_to_remember: 10_000,
            cleanup_after_days: 7,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            queries: Vec::new(),
            queries_file: Some(PathBuf::from("search_queries.txt")),
        }
    }
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("screenshots"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_prefix: "mercari-watcher.log".to_string(),
        }
    }
}

impl TimingConfig {
    pub fn search_delay(&self) -> Duration {
        Duration::from_secs_f64(self.search_delay)
    }

    pub fn page_transition_delay(&self) -> Duration {
        Duration::from_secs_f64(self.page_transition_delay)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }
}

impl NotificationsConfig {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_delay)
    }
}

impl AppConfig {
    /// Loads the configuration file (explicit path, or `config/default` when absent),
    /// overlays `MERCARI__*` environment variables and validates the result.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (DEFAULT_CONFIG_PATH, false),
        };

        let s = Config::builder()
            .add_source(File::with_name(path).required(required))
            // Environment variables with prefix "MERCARI", e.g. MERCARI__TIMING__MAX_RETRIES
            .add_source(Environment::with_prefix("MERCARI").separator("__"))
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;

        // Credentials usually live in .env rather than the config file
        if config.notifications.telegram.bot_token.is_none() {
            config.notifications.telegram.bot_token = env::var("TELEGRAM_BOT_TOKEN").ok();
        }
        if config.notifications.telegram.chat_id.is_none() {
            config.notifications.telegram.chat_id = env::var("TELEGRAM_CHAT_ID").ok();
        }
        if config.browser.chrome_path.is_none() {
            config.browser.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Notification credentials
        let has_token = self
            .notifications
            .telegram
            .bot_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        let has_chat = self
            .notifications
            .telegram
            .chat_id
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if !has_token || !has_chat {
            return Err(ConfigError::Message(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set".into(),
            ));
        }

        if Url::parse(&self.notifications.telegram.api_base_url).is_err() {
            return Err(ConfigError::Message("Invalid Telegram API base URL".into()));
        }

        // Source and selectors
        if Url::parse(&self.source.search_url).is_err() {
            return Err(ConfigError::Message("Invalid search URL format".into()));
        }

        match Regex::new(&self.source.item_id_pattern) {
            Ok(re) if re.captures_len() >= 2 => {}
            Ok(_) => {
                return Err(ConfigError::Message(
                    "item_id_pattern must contain a capture group".into(),
                ));
            }
            Err(e) => {
                return Err(ConfigError::Message(format!("Invalid item_id_pattern: {}", e)));
            }
        }

        let mut selectors = vec![
            ("listings", &self.selectors.listings),
            ("item_url", &self.selectors.item_url),
            ("item_title", &self.selectors.item_title),
            ("item_price", &self.selectors.item_price),
            ("item_image", &self.selectors.item_image),
            ("no_results", &self.selectors.no_results),
        ];
        if let Some(block) = &self.selectors.block_indicator {
            selectors.push(("block_indicator", block));
        }
        for (name, selector) in selectors {
            if scraper::Selector::parse(selector).is_err() {
                return Err(ConfigError::Message(format!(
                    "Invalid CSS selector for selectors.{}: {}",
                    name, selector
                )));
            }
        }

        // Timing
        if self.timing.max_retries == 0 {
            return Err(ConfigError::Message("timing.max_retries must be greater than 0".into()));
        }

        let delays = [
            ("timing.search_delay", self.timing.search_delay),
            ("timing.page_transition_delay", self.timing.page_transition_delay),
            ("timing.retry_delay", self.timing.retry_delay),
            ("notifications.rate_limit_delay", self.notifications.rate_limit_delay),
        ];
        for (name, value) in delays {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Message(format!(
                    "{} must be a non-negative number of seconds",
                    name
                )));
            }
        }

        // Filtering
        if self.filtering.min_price_jpy > self.filtering.max_price_jpy {
            return Err(ConfigError::Message("min_price_jpy cannot exceed max_price_jpy".into()));
        }

        if !(0.0..=1.0).contains(&self.filtering.max_solid_color_ratio) {
            return Err(ConfigError::Message(
                "max_solid_color_ratio must be between 0 and 1".into(),
            ));
        }

        // Notifications
        if self.notifications.max_images_per_notification == 0 {
            return Err(ConfigError::Message(
                "max_images_per_notification must be greater than 0".into(),
            ));
        }

        if let Some(rate) = self.notifications.jpy_to_eur_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::Message("jpy_to_eur_rate must be positive".into()));
            }
        }

        // Storage
        if self.storage.max_products_to_remember == 0 {
            return Err(ConfigError::Message(
                "max_products_to_remember must be greater than 0".into(),
            ));
        }

        if self.storage.cleanup_after_days == 0 {
            return Err(ConfigError::Message("cleanup_after_days must be greater than 0".into()));
        }

        // Monitor
        if self.monitor.interval_minutes == 0 {
            return Err(ConfigError::Message("interval_minutes must be greater than 0".into()));
        }

        if self.monitor.queries.iter().any(|q| q.text.trim().is_empty()) {
            return Err(ConfigError::Message("Search queries cannot be empty".into()));
        }

        Ok(())
    }
}
