use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Scraping error: {0}")]
    Scraping(String),

    #[error("Notification error: {channel}: {message}")]
    Notification { channel: String, message: String },

    #[error("Exchange rate unavailable: {0}")]
    RateUnavailable(String),

    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("Corrupt state file: {0}")]
    StateCorruption(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Channel failures leave the batch uncommitted so it is retried next cycle.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, AppError::Notification { .. } | AppError::Http(_))
    }
}

// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
