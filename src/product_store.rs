use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::KnownProductRecord;
use crate::utils::error::{AppError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub last_24h: usize,
    pub last_7d: usize,
    pub size_bytes: u64,
}

/// Durable set of already-notified items, keyed by external id.
///
/// Records are kept in a map plus an ordering index on `(first_seen_at, id)` so
/// capacity eviction and age cleanup pop the oldest entries without a scan.
/// Every mutation rewrites the whole JSON file through a temp file + rename.
pub struct ProductStore {
    path: PathBuf,
    max_products: usize,
    records: HashMap<String, KnownProductRecord>,
    by_age: BTreeSet<(DateTime<Utc>, String)>,
}

impl ProductStore {
    /// Opens the store at `path`. A missing or unreadable file starts an empty store.
    pub fn open(path: impl Into<PathBuf>, max_products: usize) -> Self {
        let path = path.into();
        let mut store = Self {
            path,
            max_products: max_products.max(1),
            records: HashMap::new(),
            by_age: BTreeSet::new(),
        };

        match load_records(&store.path) {
            Ok(Some(records)) => {
                for (_, record) in records {
                    store.insert_indexed(record);
                }
                tracing::info!(
                    count = store.records.len(),
                    path = %store.path.display(),
                    "Loaded known products"
                );
                let evicted = store.evict_over_capacity();
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "Evicted products over capacity on load");
                    if let Err(e) = store.persist() {
                        tracing::error!(error = %e, "Failed to rewrite product store after eviction");
                    }
                }
            }
            Ok(None) => {
                tracing::info!(
                    path = %store.path.display(),
                    "No existing product store found; a new one will be created on save"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %store.path.display(),
                    "Failed to load product store; state was reset to empty"
                );
            }
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, external_id: &str) -> Option<&KnownProductRecord> {
        self.records.get(external_id)
    }

    /// True when the id has never been committed (or has since been evicted).
    pub fn is_new(&self, external_id: &str) -> bool {
        !self.records.contains_key(external_id)
    }

    /// Stores the record unless its id is already known. Returns whether anything was inserted.
    ///
    /// Over capacity, the records with the smallest `first_seen_at` are evicted
    /// before the file is rewritten.
    pub fn record_seen(&mut self, record: KnownProductRecord) -> Result<bool> {
        if self.records.contains_key(&record.external_id) {
            return Ok(false);
        }

        let id = record.external_id.clone();
        self.insert_indexed(record);
        let evicted = self.evict_over_capacity();
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted oldest products to stay within capacity");
        }

        self.persist()?;
        tracing::debug!(product_id = %id, "Recorded product");
        Ok(true)
    }

    /// Removes every record first seen more than `max_age_days` ago.
    pub fn cleanup_older_than(&mut self, max_age_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(max_age_days as i64);
        self.cleanup_before(cutoff)
    }

    /// Removes records with `first_seen_at` strictly before `cutoff`.
    pub fn cleanup_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        while let Some((seen_at, _)) = self.by_age.first() {
            if *seen_at >= cutoff {
                break;
            }
            if let Some((_, id)) = self.by_age.pop_first() {
                self.records.remove(&id);
                removed += 1;
            }
        }

        if removed > 0 {
            self.persist()?;
            tracing::info!(count = removed, "Cleaned up old products");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> StoreStats {
        self.stats_at(Utc::now())
    }

    /// Windows count by `first_seen_at` only.
    pub fn stats_at(&self, now: DateTime<Utc>) -> StoreStats {
        let day_ago = now - Duration::hours(24);
        let week_ago = now - Duration::days(7);
        let size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        StoreStats {
            total: self.records.len(),
            last_24h: self.by_age.range((day_ago, String::new())..).count(),
            last_7d: self.by_age.range((week_ago, String::new())..).count(),
            size_bytes,
        }
    }

    fn insert_indexed(&mut self, record: KnownProductRecord) {
        if let Some(previous) = self.records.get(&record.external_id) {
            self.by_age
                .remove(&(previous.first_seen_at, previous.external_id.clone()));
        }
        self.by_age
            .insert((record.first_seen_at, record.external_id.clone()));
        self.records.insert(record.external_id.clone(), record);
    }

    fn evict_over_capacity(&mut self) -> Vec<KnownProductRecord> {
        let mut evicted = Vec::new();
        while self.records.len() > self.max_products {
            match self.by_age.pop_first() {
                Some((_, id)) => {
                    if let Some(record) = self.records.remove(&id) {
                        evicted.push(record);
                    }
                }
                None => break,
            }
        }
        evicted
    }

    fn persist(&self) -> Result<()> {
        let snapshot: HashMap<&str, &KnownProductRecord> = self
            .records
            .iter()
            .map(|(id, record)| (id.as_str(), record))
            .collect();
        write_atomically(&self.path, &serde_json::to_vec_pretty(&snapshot)?)
    }
}

fn load_records(path: &Path) -> Result<Option<HashMap<String, KnownProductRecord>>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(AppError::StateCorruption("state file is empty".to_string()));
    }

    let mut records: HashMap<String, KnownProductRecord> = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::StateCorruption(e.to_string()))?;

    // The map key is authoritative for identity
    for (id, record) in records.iter_mut() {
        if record.external_id != *id {
            record.external_id = id.clone();
        }
    }
    Ok(Some(records))
}

/// Writes `bytes` next to `path` and renames over it, so readers only ever
/// see the previous or the new complete file.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "products.json".to_string());
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
