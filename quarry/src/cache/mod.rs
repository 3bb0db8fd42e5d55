//! Content-addressed result cache.
//!
//! Keyed by sha256 of the normalized query plus the dataset ID. Entries
//! carry an expiration picked from the size of the result, and each
//! organization has a byte budget enforced by LRU eviction at write time.
//! The cache is strictly best-effort: callers log failures and move on.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::CacheError;
use crate::types::{DatasetId, OrgId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Per-organization budget in bytes.
    pub org_budget_bytes: u64,
    /// Entries larger than this are never cached.
    pub max_entry_bytes: usize,
    /// Eviction drains an organization to this fraction of its budget.
    pub eviction_target_ratio: f64,
    /// Results with more rows than this expire fastest.
    pub large_row_threshold: usize,
    pub medium_row_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub large_result_ttl: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub medium_result_ttl: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub default_ttl: std::time::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            org_budget_bytes: 1000 * 1024 * 1024,
            max_entry_bytes: 10 * 1024 * 1024,
            eviction_target_ratio: 0.8,
            large_row_threshold: 10_000,
            medium_row_threshold: 1_000,
            large_result_ttl: std::time::Duration::from_secs(6 * 3600),
            medium_result_ttl: std::time::Duration::from_secs(12 * 3600),
            default_ttl: std::time::Duration::from_secs(24 * 3600),
        }
    }
}

/// The cache key: sha256 of the lowercased, trimmed query joined with the
/// dataset ID. Two queries differing only in case or surrounding whitespace
/// share an entry.
pub fn cache_key(query: &str, dataset_id: DatasetId) -> String {
    let normalized = query.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b":");
    hasher.update(dataset_id.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    query: String,
    dataset_id: DatasetId,
    org_id: OrgId,
    payload: serde_json::Value,
    size_bytes: usize,
    access_count: u64,
    last_accessed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Default)]
struct HitCounters {
    hits: u64,
    misses: u64,
}

/// Aggregate view of one organization's cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub active_entries: usize,
    pub total_size_bytes: u64,
    /// hits / (hits + misses) since process start; None before any lookup.
    pub hit_rate: Option<f64>,
    /// Most-accessed queries, descending, at most ten.
    pub popular_queries: Vec<(String, u64)>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    org_sizes: HashMap<OrgId, u64>,
}

pub struct ResultCache {
    config: CacheConfig,
    // One lock across entries and the per-org size index keeps the
    // budget-check-then-write sequence atomic.
    inner: Mutex<CacheInner>,
    counters: DashMap<OrgId, HitCounters>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
            counters: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a cached result. A hit bumps the access count and recency.
    pub fn lookup(
        &self,
        query: &str,
        dataset_id: DatasetId,
        org_id: OrgId,
    ) -> Option<serde_json::Value> {
        if !self.config.enabled {
            return None;
        }

        let key = cache_key(query, dataset_id);
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let hit = match inner.entries.get_mut(&key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed_at = now;
                Some(entry.payload.clone())
            }
            _ => None,
        };
        drop(inner);

        let mut counters = self.counters.entry(org_id).or_default();
        if hit.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        hit
    }

    /// Store a result. Enforces the per-entry cap and the organization's
    /// byte budget (evicting coldest-first) before inserting.
    pub fn store(
        &self,
        query: &str,
        dataset_id: DatasetId,
        org_id: OrgId,
        payload: &serde_json::Value,
    ) -> Result<(), CacheError> {
        if !self.config.enabled {
            return Ok(());
        }
        if payload.is_null() {
            return Err(CacheError::NotCacheable("null result".to_string()));
        }
        if payload.get("error").is_some() {
            return Err(CacheError::NotCacheable(
                "result contains an error".to_string(),
            ));
        }

        let size_bytes = serde_json::to_vec(payload)?.len();
        if size_bytes > self.config.max_entry_bytes {
            return Err(CacheError::EntryTooLarge {
                size: size_bytes,
                cap: self.config.max_entry_bytes,
            });
        }

        let now = Utc::now();
        let ttl = self.ttl_for(payload);
        let key = cache_key(query, dataset_id);

        let mut inner = self.inner.lock();

        // Replacing an entry frees its old size first.
        if let Some(old) = inner.entries.remove(&key) {
            let org_size = inner.org_sizes.entry(old.org_id).or_default();
            *org_size = org_size.saturating_sub(old.size_bytes as u64);
        }

        self.evict_to_fit(&mut inner, org_id, size_bytes as u64);

        inner.entries.insert(
            key,
            CacheEntry {
                query: query.trim().to_lowercase(),
                dataset_id,
                org_id,
                payload: payload.clone(),
                size_bytes,
                access_count: 0,
                last_accessed_at: now,
                expires_at: now
                    + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(24)),
            },
        );
        *inner.org_sizes.entry(org_id).or_default() += size_bytes as u64;
        Ok(())
    }

    /// Expire every entry for a dataset immediately.
    pub fn invalidate_dataset(&self, dataset_id: DatasetId) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let mut invalidated = 0;
        for entry in inner.entries.values_mut() {
            if entry.dataset_id == dataset_id && !entry.is_expired(now) {
                entry.expires_at = now;
                invalidated += 1;
            }
        }
        debug!(%dataset_id, invalidated, "invalidated dataset cache entries");
        invalidated
    }

    /// Delete expired entries. Idempotent; a second sweep with no
    /// intervening writes removes nothing.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                let org_size = inner.org_sizes.entry(entry.org_id).or_default();
                *org_size = org_size.saturating_sub(entry.size_bytes as u64);
            }
        }
        expired.len()
    }

    pub fn statistics(&self, org_id: OrgId) -> CacheStatistics {
        let now = Utc::now();
        let inner = self.inner.lock();

        let org_entries: Vec<&CacheEntry> = inner
            .entries
            .values()
            .filter(|e| e.org_id == org_id)
            .collect();
        let active = org_entries.iter().filter(|e| !e.is_expired(now)).count();
        let total_size: u64 = org_entries.iter().map(|e| e.size_bytes as u64).sum();

        let mut popular: Vec<(String, u64)> = org_entries
            .iter()
            .map(|e| (e.query.clone(), e.access_count))
            .collect();
        popular.sort_by(|a, b| b.1.cmp(&a.1));
        popular.truncate(10);

        let hit_rate = self.counters.get(&org_id).and_then(|c| {
            let total = c.hits + c.misses;
            (total > 0).then(|| c.hits as f64 / total as f64)
        });

        CacheStatistics {
            total_entries: org_entries.len(),
            active_entries: active,
            total_size_bytes: total_size,
            hit_rate,
            popular_queries: popular,
        }
    }

    /// Expiration tier from the row count of the payload's tabular data:
    /// bigger results go stale faster.
    fn ttl_for(&self, payload: &serde_json::Value) -> std::time::Duration {
        let rows = payload
            .pointer("/data/rows")
            .and_then(|r| r.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        if rows > self.config.large_row_threshold {
            self.config.large_result_ttl
        } else if rows > self.config.medium_row_threshold {
            self.config.medium_result_ttl
        } else {
            self.config.default_ttl
        }
    }

    /// Evict this organization's coldest entries, ordered by
    /// (last_accessed_at, access_count) ascending, until the incoming entry
    /// fits under the eviction target.
    fn evict_to_fit(&self, inner: &mut CacheInner, org_id: OrgId, incoming_bytes: u64) {
        let budget = self.config.org_budget_bytes;
        let target = (budget as f64 * self.config.eviction_target_ratio) as u64;
        let current = inner.org_sizes.get(&org_id).copied().unwrap_or(0);

        if current + incoming_bytes <= budget {
            return;
        }

        let mut candidates: Vec<(DateTime<Utc>, u64, String, u64)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.org_id == org_id)
            .map(|(k, e)| {
                (
                    e.last_accessed_at,
                    e.access_count,
                    k.clone(),
                    e.size_bytes as u64,
                )
            })
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut size = current;
        let mut evicted = 0usize;
        for (_, _, key, entry_size) in candidates {
            if size + incoming_bytes <= target {
                break;
            }
            inner.entries.remove(&key);
            size = size.saturating_sub(entry_size);
            evicted += 1;
        }
        inner.org_sizes.insert(org_id, size);
        debug!(%org_id, evicted, "evicted cache entries to fit budget");
    }
}
