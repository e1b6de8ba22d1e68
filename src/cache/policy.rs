//! Eviction policies over the ordered cache table.
//!
//! The table is an unbounded [`LruCache`] used purely as an ordered map:
//! iteration from the back yields the least-recently-used entry first.
//! Policies decide how hits and puts reorder it and which entries to offer
//! as eviction candidates. Only entries whose value reports
//! [`Evictable::can_evict`] are ever offered.

use std::collections::HashMap;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::key::CacheEngineKey;
use crate::memory::MemoryObj;

/// Ordered key table, least-recently-used at the back.
pub type CacheTable<V> = LruCache<CacheEngineKey, V>;

/// Values that can veto their own eviction.
pub trait Evictable {
    fn can_evict(&self) -> bool;
}

impl Evictable for MemoryObj {
    fn can_evict(&self) -> bool {
        MemoryObj::can_evict(self)
    }
}

/// Hit/put/evict bookkeeping and candidate selection.
pub trait CachePolicy<V: Evictable>: Send {
    fn name(&self) -> &'static str;

    /// A fresh, empty table.
    fn init_table(&self) -> CacheTable<V> {
        LruCache::unbounded()
    }

    fn update_on_hit(&mut self, key: &CacheEngineKey, table: &mut CacheTable<V>);

    fn update_on_put(&mut self, key: &CacheEngineKey);

    fn update_on_force_evict(&mut self, key: &CacheEngineKey);

    /// Up to `num_candidates` evictable keys, in eviction order.
    fn get_evict_candidates(&self, table: &CacheTable<V>, num_candidates: usize)
        -> Vec<CacheEngineKey>;
}

/// Policy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CachePolicyKind {
    #[default]
    Lru,
    Fifo,
    Lfu,
}

impl CachePolicyKind {
    pub fn build<V: Evictable + 'static>(&self) -> Box<dyn CachePolicy<V>> {
        match self {
            CachePolicyKind::Lru => Box::new(LruPolicy),
            CachePolicyKind::Fifo => Box::new(FifoPolicy),
            CachePolicyKind::Lfu => Box::new(LfuPolicy::default()),
        }
    }
}

fn oldest_evictable<V: Evictable>(table: &CacheTable<V>, n: usize) -> Vec<CacheEngineKey> {
    table
        .iter()
        .rev()
        .filter(|(_, v)| v.can_evict())
        .take(n)
        .map(|(k, _)| k.clone())
        .collect()
}

/// Least recently used: a hit moves the key to the front.
#[derive(Debug, Default)]
pub struct LruPolicy;

impl<V: Evictable> CachePolicy<V> for LruPolicy {
    fn name(&self) -> &'static str {
        "LRU"
    }

    fn update_on_hit(&mut self, key: &CacheEngineKey, table: &mut CacheTable<V>) {
        table.promote(key);
    }

    fn update_on_put(&mut self, _key: &CacheEngineKey) {}

    fn update_on_force_evict(&mut self, _key: &CacheEngineKey) {}

    fn get_evict_candidates(&self, table: &CacheTable<V>, num_candidates: usize) -> Vec<CacheEngineKey> {
        oldest_evictable(table, num_candidates)
    }
}

/// First in, first out: hits do not reorder.
#[derive(Debug, Default)]
pub struct FifoPolicy;

impl<V: Evictable> CachePolicy<V> for FifoPolicy {
    fn name(&self) -> &'static str {
        "FIFO"
    }

    fn update_on_hit(&mut self, _key: &CacheEngineKey, _table: &mut CacheTable<V>) {}

    fn update_on_put(&mut self, _key: &CacheEngineKey) {}

    fn update_on_force_evict(&mut self, _key: &CacheEngineKey) {}

    fn get_evict_candidates(&self, table: &CacheTable<V>, num_candidates: usize) -> Vec<CacheEngineKey> {
        oldest_evictable(table, num_candidates)
    }
}

/// Least frequently used; ties go to the older entry.
#[derive(Debug, Default)]
pub struct LfuPolicy {
    hits: HashMap<CacheEngineKey, u64>,
}

impl<V: Evictable> CachePolicy<V> for LfuPolicy {
    fn name(&self) -> &'static str {
        "LFU"
    }

    fn update_on_hit(&mut self, key: &CacheEngineKey, _table: &mut CacheTable<V>) {
        if let Some(count) = self.hits.get_mut(key) {
            *count += 1;
        }
    }

    fn update_on_put(&mut self, key: &CacheEngineKey) {
        self.hits.insert(key.clone(), 0);
    }

    fn update_on_force_evict(&mut self, key: &CacheEngineKey) {
        self.hits.remove(key);
    }

    fn get_evict_candidates(&self, table: &CacheTable<V>, num_candidates: usize) -> Vec<CacheEngineKey> {
        let mut scored: Vec<(u64, &CacheEngineKey)> = table
            .iter()
            .rev()
            .filter(|(_, v)| v.can_evict())
            .map(|(k, _)| (self.hits.get(k).copied().unwrap_or(0), k))
            .collect();
        // Stable sort keeps table order among equal counts.
        scored.sort_by_key(|(count, _)| *count);
        scored
            .into_iter()
            .take(num_candidates)
            .map(|(_, k)| k.clone())
            .collect()
    }
}
