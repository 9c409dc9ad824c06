use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A search term plus the minimum time between two fetches of it.
///
/// Queries without an interval run on every scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub interval_minutes: Option<u64>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            interval_minutes: None,
        }
    }

    pub fn with_interval(mut self, minutes: u64) -> Self {
        self.interval_minutes = Some(minutes);
        self
    }

    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.interval_minutes, last_run) {
            (Some(minutes), Some(last)) => {
                now.signed_duration_since(last) >= Duration::minutes(minutes as i64)
            }
            _ => true,
        }
    }
}

/// Parses a queries file: one query per line, blank lines and `#` comments skipped.
pub fn parse_queries(contents: &str) -> Vec<SearchQuery> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(SearchQuery::new)
        .collect()
}

/// Reads the queries file; a missing file yields no queries.
pub fn load_queries_file(path: &Path) -> std::io::Result<Vec<SearchQuery>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse_queries(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Search queries file not found");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Merges configured and file-based queries, dropping duplicate texts (first wins).
pub fn merge_queries(configured: &[SearchQuery], from_file: Vec<SearchQuery>) -> Vec<SearchQuery> {
    let mut merged: Vec<SearchQuery> = Vec::with_capacity(configured.len() + from_file.len());
    for query in configured.iter().cloned().chain(from_file) {
        if !merged.iter().any(|q| q.text == query.text) {
            merged.push(query);
        }
    }
    merged
}
