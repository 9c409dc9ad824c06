use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::error::Result;

/// A fully formatted message plus the image URLs to attach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub message_ids: Vec<i64>,
}

/// Trait for implementing notification channels
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotifierPlugin: Send + Sync {
    /// Plugin metadata
    fn name(&self) -> &str;
    fn plugin_type(&self) -> &str;

    /// Delivers one message; an `Err` means nothing should be considered delivered.
    async fn send_message(&self, message: &OutboundMessage) -> Result<NotificationReceipt>;
    async fn test_connection(&self) -> Result<bool>;
}
