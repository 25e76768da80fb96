//! Per-panel local cache store.
//!
//! A key-value blob store used for warm-start restoration: the orchestrator
//! writes a snapshot of panel state after every meaningful streaming event
//! and reads it back once, at panel mount, before the first network call.
//!
//! The store is constructor-injected with an explicit open/close lifecycle,
//! never ambient global state. Every operation degrades gracefully: missing
//! owner identifiers are a no-op, and backing-store failures are logged and
//! swallowed, never thrown to the orchestrator.

use crate::error::CacheError;
use crate::types::TimeRange;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

const CACHE_TREE: &str = "panel_cache";

/// Owner identifiers for one cached panel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PanelCacheKey {
    pub folder_id: String,
    pub dashboard_id: String,
    pub panel_id: String,
}

impl PanelCacheKey {
    pub fn new(
        folder_id: impl Into<String>,
        dashboard_id: impl Into<String>,
        panel_id: impl Into<String>,
    ) -> Self {
        Self {
            folder_id: folder_id.into(),
            dashboard_id: dashboard_id.into(),
            panel_id: panel_id.into(),
        }
    }

    /// `folderId:dashboardId:panelId`, or `None` when any identifier is
    /// missing; callers treat that as "caching disabled for this panel".
    pub fn entity_key(&self) -> Option<String> {
        if self.folder_id.is_empty() || self.dashboard_id.is_empty() || self.panel_id.is_empty() {
            return None;
        }
        Some(format!(
            "{}:{}:{}",
            self.folder_id, self.dashboard_id, self.panel_id
        ))
    }
}

/// One cached panel snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of everything that should invalidate this entry.
    pub key: String,
    /// Serialized panel state.
    pub value: Value,
    /// Time window the cached data was loaded for.
    pub cache_time_range: TimeRange,
    /// Write time, epoch milliseconds.
    pub timestamp: i64,
}

/// Nested owner map: folder → dashboard → panel → entry.
pub type GroupedEntries = HashMap<String, HashMap<String, HashMap<String, CacheEntry>>>;

/// Panel cache collaborator interface.
pub trait PanelCacheStore: Send + Sync {
    fn get_entry(&self, owner: &PanelCacheKey) -> Option<CacheEntry>;
    fn put_entry(&self, owner: &PanelCacheKey, key: String, value: Value, time_range: TimeRange);
    fn clear_all(&self);
    fn entries_grouped_by_owner(&self) -> GroupedEntries;
}

/// Sled-backed implementation with JSON-encoded values.
///
/// Entries hold a `serde_json::Value` snapshot, so the value codec must be
/// self-describing; a positional codec cannot round-trip `Value`.
pub struct SledPanelCacheStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledPanelCacheStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(CACHE_TREE)?;
        Ok(Self { db, tree })
    }

    /// Flush outstanding writes; call before drop on orderly shutdown.
    pub fn close(&self) {
        if let Err(err) = self.db.flush() {
            warn!(error = %err, "panel cache flush failed");
        }
    }

    fn try_get(&self, entity_key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(raw) = self.tree.get(entity_key.as_bytes())? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&raw)?;
        Ok(Some(entry))
    }

    fn try_put(&self, entity_key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(entry)?;
        self.tree.insert(entity_key.as_bytes(), encoded)?;
        Ok(())
    }
}

impl PanelCacheStore for SledPanelCacheStore {
    fn get_entry(&self, owner: &PanelCacheKey) -> Option<CacheEntry> {
        let entity_key = owner.entity_key()?;
        match self.try_get(&entity_key) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(entity_key = %entity_key, error = %err, "panel cache read failed");
                None
            }
        }
    }

    fn put_entry(&self, owner: &PanelCacheKey, key: String, value: Value, time_range: TimeRange) {
        let Some(entity_key) = owner.entity_key() else {
            return;
        };
        let entry = CacheEntry {
            key,
            value,
            cache_time_range: time_range,
            timestamp: Utc::now().timestamp_millis(),
        };
        if let Err(err) = self.try_put(&entity_key, &entry) {
            warn!(entity_key = %entity_key, error = %err, "panel cache write failed");
        } else {
            debug!(entity_key = %entity_key, "panel cache entry written");
        }
    }

    fn clear_all(&self) {
        if let Err(err) = self.tree.clear() {
            warn!(error = %err, "panel cache clear failed");
        }
    }

    fn entries_grouped_by_owner(&self) -> GroupedEntries {
        let mut grouped: GroupedEntries = HashMap::new();
        for item in self.tree.iter() {
            let (raw_key, raw_value) = match item {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "panel cache scan failed");
                    break;
                }
            };
            let Ok(entity_key) = std::str::from_utf8(&raw_key) else {
                continue;
            };
            let mut parts = entity_key.splitn(3, ':');
            let (Some(folder), Some(dashboard), Some(panel)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<CacheEntry>(&raw_value) else {
                continue;
            };
            grouped
                .entry(folder.to_string())
                .or_default()
                .entry(dashboard.to_string())
                .or_default()
                .insert(panel.to_string(), entry);
        }
        grouped
    }
}
