pub mod config;
pub mod image_filter;
pub mod listing_fetcher;
pub mod models;
pub mod monitor;
pub mod notification_dispatcher;
pub mod plugins;
pub mod product_store;
pub mod scheduler;
pub mod scraper;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
