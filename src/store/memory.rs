//! In-process store implementing every store contract.
//!
//! Useful for single-process deployments and for exercising the shared-store
//! strategies without a running memcached or redis. Expiry is checked lazily
//! when a key is touched.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CounterStore, ListStore, SortedSetStore};
use crate::error::{RateWindowError, Result};

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(score) = self.scores.remove(member) {
            self.ordered.remove(&(score, member.to_string()));
        }
    }
}

/// A store living entirely in this process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, Expiring<u64>>,
    lists: DashMap<String, Expiring<VecDeque<String>>>,
    sorted_sets: DashMap<String, Expiring<SortedSet>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys across all structures.
    pub fn key_count(&self) -> usize {
        self.counters.iter().filter(|e| !e.is_expired()).count()
            + self.lists.iter().filter(|e| !e.is_expired()).count()
            + self.sorted_sets.iter().filter(|e| !e.is_expired()).count()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RateWindowError::StoreUnavailable(
                "memory store is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn purge_list(&self, key: &str) {
        self.lists.remove_if(key, |_, entry| entry.is_expired());
    }

    fn purge_sorted_set(&self, key: &str) {
        self.sorted_sets.remove_if(key, |_, entry| entry.is_expired());
    }
}

/// Resolve redis-style (possibly negative) inclusive indices against `len`.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        self.counters.remove_if(key, |_, entry| entry.is_expired());
        Ok(self.counters.get(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: u64, ttl_secs: u64) -> Result<()> {
        self.ensure_open()?;
        let expires_at = (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs));
        self.counters
            .insert(key.to_string(), Expiring { value, expires_at });
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.counters.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.purge_list(key);
        let Some(entry) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let items = &entry.value;
        Ok(match resolve_range(items.len(), start, stop) {
            Some((from, to)) => items.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        self.purge_list(key);
        let popped = self
            .lists
            .get_mut(key)
            .and_then(|mut entry| entry.value.pop_front());
        self.lists.remove_if(key, |_, entry| entry.value.is_empty());
        Ok(popped)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        self.ensure_open()?;
        self.purge_list(key);
        let mut entry = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(VecDeque::new()));
        entry.value.push_back(value.to_string());
        Ok(entry.value.len())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.ensure_open()?;
        self.purge_list(key);
        Ok(self.lists.get(key).map_or(0, |entry| entry.value.len()))
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> Result<()> {
        self.ensure_open()?;
        let deadline = Instant::now() + Duration::from_millis(ttl_ms);
        if let Some(mut entry) = self.lists.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        if let Some(mut entry) = self.sorted_sets.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.ensure_open()?;
        self.lists.retain(|key, _| !key.starts_with(prefix));
        self.sorted_sets.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SortedSetStore for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        self.ensure_open()?;
        self.purge_sorted_set(key);
        self.sorted_sets
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(SortedSet::default()))
            .value
            .insert(member, score);
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max_exclusive: i64) -> Result<usize> {
        self.ensure_open()?;
        self.purge_sorted_set(key);
        let Some(mut entry) = self.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let doomed: Vec<String> = entry
            .value
            .ordered
            .iter()
            .filter(|(score, _)| *score >= min && *score < max_exclusive)
            .map(|(_, member)| member.clone())
            .collect();
        for member in &doomed {
            entry.value.remove(member);
        }
        Ok(doomed.len())
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>> {
        self.ensure_open()?;
        self.purge_sorted_set(key);
        let Some(entry) = self.sorted_sets.get(key) else {
            return Ok(None);
        };
        let set = &entry.value;
        Ok(set.scores.get(member).map(|score| {
            set.ordered
                .range(..(*score, member.to_string()))
                .count()
        }))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(mut entry) = self.sorted_sets.get_mut(key) {
            entry.value.remove(member);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> Result<()> {
        ListStore::expire(self, key, ttl_ms).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        ListStore::delete_prefix(self, prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(5, 0, 0), Some((0, 0)));
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 3, 100), Some((3, 4)));
        assert_eq!(resolve_range(0, 0, 0), None);
        assert_eq!(resolve_range(5, 4, 2), None);
    }

    #[tokio::test]
    async fn test_counter_set_and_get() {
        let store = MemoryStore::new();

        assert_eq!(CounterStore::get(&store, "a").await.unwrap(), None);
        store.set("a", 3, 60).await.unwrap();
        assert_eq!(CounterStore::get(&store, "a").await.unwrap(), Some(3));

        store.flush().await.unwrap();
        assert_eq!(CounterStore::get(&store, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_operations() {
        let store = MemoryStore::new();

        assert_eq!(store.rpush("l", "1").await.unwrap(), 1);
        assert_eq!(store.rpush("l", "2").await.unwrap(), 2);
        assert_eq!(store.lrange("l", 0, 0).await.unwrap(), vec!["1".to_string()]);
        assert_eq!(store.lpop("l").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.llen("l").await.unwrap(), 1);
        assert_eq!(store.lpop("l").await.unwrap(), Some("2".to_string()));
        assert_eq!(store.lpop("l").await.unwrap(), None);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_list_expiry() {
        let store = MemoryStore::new();
        store.rpush("l", "1").await.unwrap();
        ListStore::expire(&store, "l", 20).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.llen("l").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sorted_set_rank_and_trim() {
        let store = MemoryStore::new();
        store.zadd("z", "c", 300).await.unwrap();
        store.zadd("z", "a", 100).await.unwrap();
        store.zadd("z", "b", 200).await.unwrap();

        assert_eq!(store.zrank("z", "a").await.unwrap(), Some(0));
        assert_eq!(store.zrank("z", "c").await.unwrap(), Some(2));

        // 100 and 200 are below 250, 300 stays
        assert_eq!(store.zrem_range_by_score("z", i64::MIN, 250).await.unwrap(), 2);
        assert_eq!(store.zrank("z", "c").await.unwrap(), Some(0));
        assert_eq!(store.zrank("z", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_trim_upper_bound_is_exclusive() {
        let store = MemoryStore::new();
        store.zadd("z", "edge", 100).await.unwrap();

        assert_eq!(store.zrem_range_by_score("z", i64::MIN, 100).await.unwrap(), 0);
        assert_eq!(store.zrank("z", "edge").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_delete_prefix_only_touches_prefix() {
        let store = MemoryStore::new();
        store.rpush("mine:a", "1").await.unwrap();
        store.zadd("mine:b", "m", 1).await.unwrap();
        store.rpush("other:a", "1").await.unwrap();

        ListStore::delete_prefix(&store, "mine:").await.unwrap();

        assert_eq!(store.llen("mine:a").await.unwrap(), 0);
        assert_eq!(store.zrank("mine:b", "m").await.unwrap(), None);
        assert_eq!(store.llen("other:a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_is_unavailable() {
        let store = MemoryStore::new();
        CounterStore::close(&store).await.unwrap();

        let err = CounterStore::get(&store, "a").await.unwrap_err();
        assert!(err.is_store_failure());
        assert!(store.rpush("l", "1").await.is_err());
    }
}
