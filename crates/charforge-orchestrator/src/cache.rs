//! Prompt cache keyed by the normalized parameter hash.
//!
//! The cache only saves assembly work: a hit returns exactly what a fresh
//! assembly would. Usage statistics are kept per entry for eviction and
//! analytics.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use charforge_prompt::{AssembledPrompt, Catalog, ParameterSet, PromptAssembler};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CacheConfig;

/// One cached prompt with its usage history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCacheEntry {
    /// SHA-256 of the normalized parameter set.
    pub parameters_hash: String,
    /// The assembled prompt.
    pub prompt: AssembledPrompt,
    /// When the entry was first stored.
    pub created_at: DateTime<Utc>,
    /// When the entry was last read or written.
    pub last_used: DateTime<Utc>,
    /// Number of reads and writes.
    pub usage_count: u64,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Number of cached prompts.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 when nothing was looked up.
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, PromptCacheEntry>,
    hits: u64,
    misses: u64,
}

/// Thread-safe prompt cache.
#[derive(Debug, Default)]
pub struct PromptCache {
    inner: Mutex<Inner>,
}

impl PromptCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the prompt for `params`, bumping its usage on a hit.
    pub async fn get(&self, params: &ParameterSet) -> Option<AssembledPrompt> {
        let hash = params.hash();
        let mut inner = self.inner.lock().await;
        let found = inner.entries.get_mut(&hash).map(|entry| {
            entry.usage_count += 1;
            entry.last_used = Utc::now();
            entry.prompt.clone()
        });
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Stores `prompt` for `params`, returning the entry's usage count.
    ///
    /// Re-storing an existing key keeps its history and counts as a use.
    pub async fn put(&self, params: &ParameterSet, prompt: AssembledPrompt) -> u64 {
        let hash = params.hash();
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .entry(hash.clone())
            .and_modify(|e| {
                e.usage_count += 1;
                e.last_used = now;
                e.prompt = prompt.clone();
            })
            .or_insert_with(|| PromptCacheEntry {
                parameters_hash: hash,
                prompt,
                created_at: now,
                last_used: now,
                usage_count: 1,
            });
        entry.usage_count
    }

    /// Returns the cached prompt or assembles and caches a new one.
    pub async fn get_or_assemble(
        &self,
        params: &ParameterSet,
        catalog: &Catalog,
    ) -> charforge_prompt::Result<AssembledPrompt> {
        if let Some(prompt) = self.get(params).await {
            debug!(hash = %prompt.parameters_hash, "Prompt cache hit");
            return Ok(prompt);
        }
        let prompt = PromptAssembler::new(catalog).assemble(params)?;
        debug!(hash = %prompt.parameters_hash, "Prompt cache miss, assembled");
        self.put(params, prompt.clone()).await;
        Ok(prompt)
    }

    /// Removes entries not used since `cutoff`. Returns how many were removed.
    pub async fn evict_unused_since(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.last_used >= cutoff);
        before - inner.entries.len()
    }

    /// Removes entries unused for more than `max_age_days`.
    pub async fn evict_stale(&self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(max_age_days));
        self.evict_unused_since(cutoff).await
    }

    /// Keeps only the `k` most used entries. Returns how many were removed.
    ///
    /// Ties are broken by most recent use, then by hash.
    pub async fn retain_top(&self, k: usize) -> usize {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() <= k {
            return 0;
        }
        let keep: Vec<String> = ranked(inner.entries.values())
            .into_iter()
            .take(k)
            .map(|e| e.parameters_hash.clone())
            .collect();
        let before = inner.entries.len();
        inner.entries.retain(|hash, _| keep.contains(hash));
        before - inner.entries.len()
    }

    /// Applies both eviction policies from `config`.
    pub async fn apply_policy(&self, config: &CacheConfig) -> usize {
        let stale = self.evict_stale(config.max_age_days).await;
        let overflow = self.retain_top(config.max_entries).await;
        if stale + overflow > 0 {
            debug!(stale, overflow, "Evicted prompt cache entries");
        }
        stale + overflow
    }

    /// Returns aggregate statistics.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let lookups = inner.hits + inner.misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
        }
    }

    /// Returns the `k` most used entries, most used first.
    pub async fn top_entries(&self, k: usize) -> Vec<PromptCacheEntry> {
        let inner = self.inner.lock().await;
        ranked(inner.entries.values())
            .into_iter()
            .take(k)
            .cloned()
            .collect()
    }

    /// Number of cached prompts.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Returns `true` if the cache holds nothing.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}

fn ranked<'a>(entries: impl Iterator<Item = &'a PromptCacheEntry>) -> Vec<&'a PromptCacheEntry> {
    let mut sorted: Vec<&PromptCacheEntry> = entries.collect();
    sorted.sort_by(|a, b| {
        b.usage_count
            .cmp(&a.usage_count)
            .then_with(|| b.last_used.cmp(&a.last_used))
            .then_with(|| a.parameters_hash.cmp(&b.parameters_hash))
    });
    sorted
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn params(footwear: &str) -> ParameterSet {
        ParameterSet::new("pointing-forward", "hoodie-sweatpants", footwear)
    }

    #[tokio::test]
    async fn test_miss_then_hit_returns_identical_prompt() {
        let catalog = Catalog::builtin();
        let cache = PromptCache::new();
        let p = params("air-jordan-1-chicago");

        let first = cache.get_or_assemble(&p, &catalog).await.unwrap();
        let second = cache.get_or_assemble(&p, &catalog).await.unwrap();
        let fresh = PromptAssembler::new(&catalog).assemble(&p).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, fresh);

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_put_is_upsert_and_keeps_history() {
        let catalog = Catalog::builtin();
        let cache = PromptCache::new();
        let p = params("air-jordan-1-chicago");
        let prompt = PromptAssembler::new(&catalog).assemble(&p).unwrap();

        assert_eq!(cache.put(&p, prompt.clone()).await, 1);
        assert_eq!(cache.put(&p, prompt.clone()).await, 2);
        cache.get(&p).await.unwrap();

        let top = cache.top_entries(1).await;
        assert_eq!(top[0].usage_count, 3);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_key_ignores_absent_vs_empty_optionals() {
        let catalog = Catalog::builtin();
        let cache = PromptCache::new();
        let a = params("air-jordan-1-chicago");
        let mut b = a.clone();
        b.accessory = Some(String::new());

        cache.get_or_assemble(&a, &catalog).await.unwrap();
        assert!(cache.get(&b).await.is_some());
    }

    #[tokio::test]
    async fn test_retain_top_keeps_most_used() {
        let catalog = Catalog::builtin();
        let cache = PromptCache::new();
        let popular = params("air-jordan-1-chicago");
        let rare = params("white-canvas-sneakers");

        cache.get_or_assemble(&popular, &catalog).await.unwrap();
        cache.get_or_assemble(&popular, &catalog).await.unwrap();
        cache.get_or_assemble(&rare, &catalog).await.unwrap();

        assert_eq!(cache.retain_top(1).await, 1);
        assert!(cache.get(&popular).await.is_some());
        assert!(cache.get(&rare).await.is_none());
    }

    #[tokio::test]
    async fn test_evict_unused_since() {
        let catalog = Catalog::builtin();
        let cache = PromptCache::new();
        cache
            .get_or_assemble(&params("air-jordan-1-chicago"), &catalog)
            .await
            .unwrap();

        assert_eq!(
            cache
                .evict_unused_since(Utc::now() - ChronoDuration::days(1))
                .await,
            0
        );
        assert_eq!(
            cache
                .evict_unused_since(Utc::now() + ChronoDuration::seconds(1))
                .await,
            1
        );
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_entry_is_not_cached() {
        let catalog = Catalog::builtin();
        let cache = PromptCache::new();
        let p = params("moon-boots");

        assert!(cache.get_or_assemble(&p, &catalog).await.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_stats_empty_cache() {
        let stats = PromptCache::new().stats().await;
        assert_eq!(stats.entries, 0);
        assert!(stats.hit_rate.abs() < f64::EPSILON);
    }
}
