//! Local count cache
//!
//! Keeps the most recent reconciled counts per (location, timeframe) so a cold
//! start can show the last known value before the feed reconnects. The cache
//! only pre-populates state; the live feed stays authoritative.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::{CountUpdate, Timeframe};
use crate::error::Result;
use crate::time::Millis;

pub const DEFAULT_ENTRIES_PER_KEY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCount {
    pub count: u64,
    pub cumulative_count: u64,
    pub timeframe_count: u64,
    pub timestamp: Millis,
}

impl From<&CountUpdate> for CachedCount {
    fn from(u: &CountUpdate) -> Self {
        Self {
            count: u.count,
            cumulative_count: u.cumulative_count,
            timeframe_count: u.timeframe_count,
            timestamp: u.timestamp,
        }
    }
}

/// Storage seam for cached counts.
pub trait CountStore {
    fn record(&mut self, location_id: &str, timeframe: Timeframe, entry: CachedCount);

    fn latest(&self, location_id: &str, timeframe: Timeframe) -> Option<CachedCount>;

    fn clear(&mut self);

    /// Write the store to its backing medium, if it has one.
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

fn cache_key(location_id: &str, timeframe: Timeframe) -> String {
    format!("{location_id}_{timeframe}")
}

/// In-memory store with a per-key cap, persisted as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCountStore {
    #[serde(skip, default = "default_cap")]
    cap: usize,
    #[serde(skip)]
    path: Option<PathBuf>,
    entries: BTreeMap<String, VecDeque<CachedCount>>,
}

fn default_cap() -> usize {
    DEFAULT_ENTRIES_PER_KEY
}

impl Default for MemoryCountStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ENTRIES_PER_KEY)
    }
}

impl MemoryCountStore {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            path: None,
            entries: BTreeMap::new(),
        }
    }

    /// Persist to `path` on [`CountStore::persist`].
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn history(&self, location_id: &str, timeframe: Timeframe) -> Vec<CachedCount> {
        self.entries
            .get(&cache_key(location_id, timeframe))
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a snapshot, trimming every key to `cap`.
    pub fn from_json(json: &str, cap: usize) -> Result<Self> {
        let mut store: Self = serde_json::from_str(json)?;
        store.cap = cap.max(1);
        for queue in store.entries.values_mut() {
            while queue.len() > store.cap {
                queue.pop_front();
            }
        }
        Ok(store)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)?;
        debug!(path = %path.display(), keys = self.entries.len(), "Count cache saved");
        Ok(())
    }

    /// Load a snapshot; a missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>, cap: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::with_capacity(cap).with_path(path));
        }
        let store = Self::from_json(&std::fs::read_to_string(path)?, cap)?.with_path(path);
        info!(path = %path.display(), keys = store.entries.len(), "Count cache loaded");
        Ok(store)
    }
}

impl CountStore for MemoryCountStore {
    fn record(&mut self, location_id: &str, timeframe: Timeframe, entry: CachedCount) {
        let queue = self.entries.entry(cache_key(location_id, timeframe)).or_default();
        queue.push_back(entry);
        while queue.len() > self.cap {
            queue.pop_front();
        }
    }

    fn latest(&self, location_id: &str, timeframe: Timeframe) -> Option<CachedCount> {
        self.entries
            .get(&cache_key(location_id, timeframe))
            .and_then(|q| q.back().copied())
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(count: u64, timestamp: Millis) -> CachedCount {
        CachedCount {
            count,
            cumulative_count: count,
            timeframe_count: count,
            timestamp,
        }
    }

    #[test]
    fn test_keeps_most_recent_per_key() {
        let mut store = MemoryCountStore::with_capacity(3);
        for i in 0..5 {
            store.record("gate", Timeframe::Hourly, entry(i, i));
        }
        store.record("gate", Timeframe::Daily, entry(99, 0));

        let counts: Vec<u64> = store
            .history("gate", Timeframe::Hourly)
            .iter()
            .map(|e| e.count)
            .collect();
        assert_eq!(counts, vec![2, 3, 4]);
        assert_eq!(store.latest("gate", Timeframe::Daily).map(|e| e.count), Some(99));
        assert_eq!(store.latest("east", Timeframe::Daily), None);
    }

    #[test]
    fn test_json_snapshot_uses_camel_case_and_trims() {
        let mut store = MemoryCountStore::with_capacity(10);
        for i in 0..4 {
            store.record("gate", Timeframe::Hourly, entry(i, i));
        }
        let json = store.to_json().unwrap();
        assert!(json.contains("\"gate_HOURLY\""));
        assert!(json.contains("\"cumulativeCount\""));

        let restored = MemoryCountStore::from_json(&json, 2).unwrap();
        assert_eq!(restored.history("gate", Timeframe::Hourly).len(), 2);
        assert_eq!(
            restored.latest("gate", Timeframe::Hourly),
            store.latest("gate", Timeframe::Hourly)
        );
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let path = std::env::temp_dir().join("occupancy-live-missing-cache.json");
        let _ = std::fs::remove_file(&path);
        let store = MemoryCountStore::load(&path, 5).unwrap();
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("occupancy-live-cache-{}.json", std::process::id()));
        let mut store = MemoryCountStore::default().with_path(&path);
        store.record("gate", Timeframe::Weekly, entry(12, 40));
        store.persist().unwrap();

        let loaded = MemoryCountStore::load(&path, DEFAULT_ENTRIES_PER_KEY).unwrap();
        assert_eq!(loaded.latest("gate", Timeframe::Weekly), Some(entry(12, 40)));
        let _ = std::fs::remove_file(&path);
    }
}
