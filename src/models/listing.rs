use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One product cell observed on a search result page.
///
/// Uniqueness is defined by `external_id` alone; title and price may change
/// between observations of the same item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingItem {
    pub external_id: String,
    pub title: String,
    pub price_jpy: u64,
    pub url: String,
    pub image_url: Option<String>,
    pub query: String,
    pub observed_at: DateTime<Utc>,
}

/// Persistent record of an item that has been notified.
///
/// Immutable once stored; only removed by age-based cleanup or capacity eviction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnownProductRecord {
    pub external_id: String,
    pub title: String,
    pub price_jpy: u64,
    pub url: String,
    pub first_seen_at: DateTime<Utc>,
    pub query: String,
}

impl KnownProductRecord {
    pub fn from_item(item: &ListingItem, first_seen_at: DateTime<Utc>) -> Self {
        Self {
            external_id: item.external_id.clone(),
            title: item.title.clone(),
            price_jpy: item.price_jpy,
            url: item.url.clone(),
            first_seen_at,
            query: item.query.clone(),
        }
    }
}

/// New items for one query, delivered as a single message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub query: String,
    pub items: Vec<ListingItem>,
    pub created_at: DateTime<Utc>,
}

impl NotificationBatch {
    pub fn new(query: impl Into<String>, items: Vec<ListingItem>) -> Self {
        Self {
            query: query.into(),
            items,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn external_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.external_id.clone()).collect()
    }
}
