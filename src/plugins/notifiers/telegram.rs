use crate::plugins::traits::{NotificationReceipt, NotifierPlugin, OutboundMessage};
use crate::utils::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const CAPTION_LIMIT: usize = 1024;
const TEXT_LIMIT: usize = 4096;
const MEDIA_GROUP_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base_url: String,
}

impl TelegramConfig {
    pub fn from_settings(settings: &crate::config::TelegramConfig) -> Result<Self> {
        let bot_token = settings
            .bot_token
            .clone()
            .ok_or_else(|| AppError::Validation("Missing Telegram bot token".to_string()))?;
        let chat_id = settings
            .chat_id
            .clone()
            .ok_or_else(|| AppError::Validation("Missing Telegram chat id".to_string()))?;

        Ok(Self {
            bot_token,
            chat_id,
            api_base_url: settings.api_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
    result: Option<serde_json::Value>,
}

pub struct TelegramNotifier {
    client: Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base_url, self.config.bot_token, method
        )
    }

    async fn call(&self, method: &str, payload: serde_json::Value) -> Result<Vec<i64>> {
        let response = self
            .client
            .post(self.endpoint(method))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: TelegramResponse = response.json().await.map_err(|e| AppError::Notification {
            channel: "telegram".to_string(),
            message: format!("{} returned HTTP {} with unreadable body: {}", method, status, e),
        })?;

        if !body.ok {
            return Err(AppError::Notification {
                channel: "telegram".to_string(),
                message: format!(
                    "{} failed: {}",
                    method,
                    body.description.unwrap_or_else(|| status.to_string())
                ),
            });
        }

        Ok(extract_message_ids(body.result.as_ref()))
    }

    async fn send_text(&self, text: &str) -> Result<Vec<i64>> {
        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": truncate(text, TEXT_LIMIT),
            "parse_mode": "MarkdownV2",
            "disable_web_page_preview": true,
        });
        self.call("sendMessage", payload).await
    }

    async fn send_photo(&self, photo_url: &str, caption: &str) -> Result<Vec<i64>> {
        let payload = json!({
            "chat_id": self.config.chat_id,
            "photo": photo_url,
            "caption": truncate(caption, CAPTION_LIMIT),
            "parse_mode": "MarkdownV2",
        });
        self.call("sendPhoto", payload).await
    }

    async fn send_media_group(&self, photo_urls: &[String]) -> Result<Vec<i64>> {
        let media: Vec<serde_json::Value> = photo_urls
            .iter()
            .take(MEDIA_GROUP_LIMIT)
            .map(|url| json!({ "type": "photo", "media": url }))
            .collect();
        let payload = json!({
            "chat_id": self.config.chat_id,
            "media": media,
        });
        self.call("sendMediaGroup", payload).await
    }
}

#[async_trait]
impl NotifierPlugin for TelegramNotifier {
    fn name(&self) -> &str {
        "Telegram Notifier"
    }

    fn plugin_type(&self) -> &str {
        "telegram"
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<NotificationReceipt> {
        let mut message_ids = Vec::new();

        match message.images.as_slice() {
            [] => {}
            [photo] => match self.send_photo(photo, &message.text).await {
                Ok(ids) => return Ok(NotificationReceipt { message_ids: ids }),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to send photo, trying text only");
                }
            },
            photos => match self.send_media_group(photos).await {
                Ok(ids) => message_ids.extend(ids),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to send media group, sending text only");
                }
            },
        }

        // The text message is what makes the notification count as delivered
        message_ids.extend(self.send_text(&message.text).await?);
        tracing::debug!(count = message_ids.len(), "Telegram message sent");
        Ok(NotificationReceipt { message_ids })
    }

    async fn test_connection(&self) -> Result<bool> {
        let response = self.client.get(self.endpoint("getMe")).send().await?;
        Ok(response.status().is_success())
    }
}

fn extract_message_ids(result: Option<&serde_json::Value>) -> Vec<i64> {
    match result {
        Some(serde_json::Value::Array(messages)) => messages
            .iter()
            .filter_map(|m| m.get("message_id").and_then(|id| id.as_i64()))
            .collect(),
        Some(message) => message
            .get("message_id")
            .and_then(|id| id.as_i64())
            .into_iter()
            .collect(),
        None => Vec::new(),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit).collect();
    // Never leave a dangling MarkdownV2 escape
    while truncated.ends_with('\\') {
        truncated.pop();
    }
    truncated
}
