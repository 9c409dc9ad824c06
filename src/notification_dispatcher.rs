use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::NotificationsConfig;
use crate::models::{ListingItem, NotificationBatch};
use crate::plugins::traits::{CurrencyConverter, NotifierPlugin, OutboundMessage};
use crate::utils::error::AppError;

const MARKDOWN_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Result of delivering one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub sent: bool,
    /// Ids that must stay uncommitted because the channel rejected the batch.
    pub failed_ids: Vec<String>,
    pub error: Option<String>,
}

/// Formats batches and pushes them through the notification channel,
/// keeping at least `rate_limit_delay` between consecutive sends.
pub struct NotificationDispatcher {
    notifier: Box<dyn NotifierPlugin>,
    converter: Box<dyn CurrencyConverter>,
    rate_limit_delay: Duration,
    max_images: usize,
    last_send: Option<Instant>,
}

impl NotificationDispatcher {
    pub fn new(
        notifier: Box<dyn NotifierPlugin>,
        converter: Box<dyn CurrencyConverter>,
        config: &NotificationsConfig,
    ) -> Self {
        Self {
            notifier,
            converter,
            rate_limit_delay: config.rate_limit_delay(),
            max_images: config.max_images_per_notification.max(1),
            last_send: None,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.notifier.name()
    }

    pub async fn test_connection(&self) -> bool {
        match self.notifier.test_connection().await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(error = %e, "Notification channel connection test failed");
                false
            }
        }
    }

    pub async fn dispatch(&mut self, batch: &NotificationBatch) -> DispatchOutcome {
        if batch.is_empty() {
            return DispatchOutcome {
                sent: true,
                ..DispatchOutcome::default()
            };
        }

        let message = self.build_message(batch);
        self.wait_for_rate_limit().await;
        let result = self.notifier.send_message(&message).await;
        self.last_send = Some(Instant::now());

        match result {
            Ok(receipt) => {
                metrics::counter!("watcher_notifications_sent_total").increment(1);
                tracing::info!(
                    query = %batch.query,
                    items = batch.len(),
                    messages = receipt.message_ids.len(),
                    channel = self.notifier.plugin_type(),
                    "Notification sent"
                );
                DispatchOutcome {
                    sent: true,
                    ..DispatchOutcome::default()
                }
            }
            Err(e) => {
                metrics::counter!("watcher_notifications_failed_total").increment(1);
                tracing::error!(
                    query = %batch.query,
                    items = batch.len(),
                    error = %e,
                    "Failed to send notification; items will be retried next cycle"
                );
                DispatchOutcome {
                    sent: false,
                    failed_ids: batch.external_ids(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn build_message(&self, batch: &NotificationBatch) -> OutboundMessage {
        match batch.items.as_slice() {
            [item] => OutboundMessage {
                text: self.single_item_text(item),
                images: item.image_url.iter().cloned().collect(),
            },
            items => OutboundMessage {
                text: self.multi_item_text(&batch.query, items),
                // Only photos of the items the text lists
                images: items
                    .iter()
                    .take(self.max_images)
                    .filter_map(|i| i.image_url.clone())
                    .collect(),
            },
        }
    }

    async fn wait_for_rate_limit(&self) {
        if let Some(last) = self.last_send {
            let elapsed = last.elapsed();
            if elapsed < self.rate_limit_delay {
                tokio::time::sleep(self.rate_limit_delay - elapsed).await;
            }
        }
    }

    fn price_line(&self, price_jpy: u64) -> String {
        let eur = match self.converter.convert_jpy_to_eur(price_jpy) {
            Ok(eur) => Some(eur),
            Err(AppError::RateUnavailable(reason)) => {
                tracing::debug!(reason = %reason, "EUR price omitted");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Currency conversion failed");
                None
            }
        };
        escape_markdown(&format_price(price_jpy, eur))
    }

    fn single_item_text(&self, item: &ListingItem) -> String {
        format!(
            "🚀 *New Product Found*\n\n*{}*\n💰 {}\n\n🔍 Query: `{}`\n[View on Mercari]({})",
            escape_markdown(&item.title),
            self.price_line(item.price_jpy),
            escape_code(&item.query),
            escape_link_url(&item.url),
        )
    }

    fn multi_item_text(&self, query: &str, items: &[ListingItem]) -> String {
        let mut text = format!(
            "🚀 *{} New Products Found*\n🔍 Query: `{}`\n",
            items.len(),
            escape_code(query)
        );

        for (index, item) in items.iter().take(self.max_images).enumerate() {
            text.push_str(&format!(
                "\n{}\\. *{}*\n💰 {}\n[View on Mercari]({})\n",
                index + 1,
                escape_markdown(&item.title),
                self.price_line(item.price_jpy),
                escape_link_url(&item.url),
            ));
        }

        let remaining = items.len().saturating_sub(self.max_images);
        if remaining > 0 {
            text.push_str(&format!("\n{}", escape_markdown(&format!("...and {} more", remaining))));
        }
        text
    }
}

/// Escapes every MarkdownV2 special character.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || MARKDOWN_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn escape_code(text: &str) -> String {
    text.replace('\\', "\\\\").replace('`', "\\`")
}

fn escape_link_url(url: &str) -> String {
    url.replace('\\', "\\\\").replace(')', "\\)")
}

/// `¥32,800 (~€209.92)`, or just the yen amount without a rate.
pub fn format_price(price_jpy: u64, eur: Option<Decimal>) -> String {
    let yen = format!("¥{}", group_thousands(price_jpy));
    match eur {
        Some(eur) => format!("{} (~€{:.2})", yen, eur),
        None => yen,
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}
