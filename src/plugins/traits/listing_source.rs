use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Rendered HTML of a search result page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub html: String,
    pub final_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceErrorKind {
    /// Navigation or rendering did not finish in time.
    Timeout,
    /// Connection-level failure talking to the site.
    Network,
    /// The browser session died; the next call starts a fresh one.
    SessionLost,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::Timeout | SourceErrorKind::Network | SourceErrorKind::SessionLost
        )
    }
}

/// Browser-side capability: load the search page for a query.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listing_snapshot(&self, query: &str) -> Result<PageSnapshot, SourceError>;

    /// Saves the current page state for offline diagnosis and returns where it went.
    async fn capture_diagnostics(&self, label: &str) -> Option<PathBuf>;

    async fn shutdown(&self) {}
}
