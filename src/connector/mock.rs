//! Throughput-simulated remote store.
//!
//! [`AsyncLru`] holds object contents under a byte capacity with
//! move-to-end-on-access ordering. [`PressureManager`] charges time for each
//! operation: a fixed peek latency for existence checks, and
//! `bytes / throughput` for reads and writes. Reads queue behind one gate and
//! writes behind another, so the two directions do not contend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::StorageBackend;
use crate::config::RemoteConfig;
use crate::connector::{ConnectorError, RemoteConnector};
use crate::key::CacheEngineKey;
use crate::memory::{MemoryObj, MemoryObjMeta};

const GIB: f64 = (1u64 << 30) as f64;

/// Floor for non-positive or NaN throughputs, in GB/s (about 1 KiB/s).
const MIN_THROUGHPUT_GBPS: f64 = 1e-6;

/// What the remote side keeps for one key.
#[derive(Debug, Clone)]
pub struct StoredObj {
    pub meta: MemoryObjMeta,
    pub data: Bytes,
}

impl StoredObj {
    fn from_obj(obj: &MemoryObj) -> Self {
        Self {
            meta: obj.meta().clone(),
            data: Bytes::from(obj.read_bytes()),
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.meta.num_bytes
    }
}

struct LruState {
    entries: LruCache<CacheEngineKey, StoredObj>,
    size: usize,
}

/// Byte-bounded LRU map behind an async lock.
pub struct AsyncLru {
    state: Mutex<LruState>,
    capacity: usize,
}

impl AsyncLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                size: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.size
    }

    pub async fn exists(&self, key: &CacheEngineKey) -> bool {
        self.state.lock().await.entries.get(key).is_some()
    }

    pub async fn get(&self, key: &CacheEngineKey) -> Option<StoredObj> {
        self.state.lock().await.entries.get(key).cloned()
    }

    /// Look up several keys without touching their recency.
    pub async fn batched_get(&self, keys: &[CacheEngineKey]) -> Vec<Option<StoredObj>> {
        let state = self.state.lock().await;
        keys.iter().map(|k| state.entries.peek(k).cloned()).collect()
    }

    /// Insert `obj`, evicting the least recently used entries to make room.
    /// An existing key is only refreshed.
    pub async fn put(&self, key: CacheEngineKey, obj: StoredObj) -> Result<(), ConnectorError> {
        let size = obj.num_bytes();
        if size > self.capacity {
            return Err(ConnectorError::ObjectTooLarge {
                size,
                capacity: self.capacity,
            });
        }

        let mut state = self.state.lock().await;
        if state.entries.get(&key).is_some() {
            return Ok(());
        }
        while state.size + size > self.capacity {
            let Some((evicted, old)) = state.entries.pop_lru() else {
                break;
            };
            state.size -= old.num_bytes();
            debug!(key = %evicted, bytes = old.num_bytes(), "Remote LRU evicted");
        }
        state.size += size;
        state.entries.put(key, obj);
        Ok(())
    }

    /// Keys from least to most recently used.
    pub async fn list(&self) -> Vec<CacheEngineKey> {
        let state = self.state.lock().await;
        state.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.size = 0;
    }
}

/// Simulated bandwidth and latency.
pub struct PressureManager {
    peeking_latency: Duration,
    read_secs_per_byte: f64,
    write_secs_per_byte: f64,
    read_gate: Mutex<()>,
    write_gate: Mutex<()>,
}

impl PressureManager {
    /// `peeking_latency_ms` in milliseconds, throughputs in GB/s.
    ///
    /// Throughputs that are zero, negative or NaN are raised to a floor of
    /// about 1 KiB/s.
    pub fn new(peeking_latency_ms: f64, read_throughput_gbps: f64, write_throughput_gbps: f64) -> Self {
        Self {
            peeking_latency: Duration::from_secs_f64(peeking_latency_ms.max(0.0) / 1000.0),
            read_secs_per_byte: secs_per_byte("read", read_throughput_gbps),
            write_secs_per_byte: secs_per_byte("write", write_throughput_gbps),
            read_gate: Mutex::new(()),
            write_gate: Mutex::new(()),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(
            config.peeking_latency_ms,
            config.read_throughput_gbps,
            config.write_throughput_gbps,
        )
    }

    /// Charged to every caller; not gated.
    pub async fn on_exists(&self) {
        if !self.peeking_latency.is_zero() {
            tokio::time::sleep(self.peeking_latency).await;
        }
    }

    pub async fn on_get(&self, bytes: usize) {
        let wait = transfer_time(self.read_secs_per_byte, bytes);
        debug!(bytes, wait_ms = wait.as_secs_f64() * 1000.0, "Simulating remote read");
        let _gate = self.read_gate.lock().await;
        tokio::time::sleep(wait).await;
    }

    pub async fn on_put(&self, bytes: usize) {
        let wait = transfer_time(self.write_secs_per_byte, bytes);
        debug!(bytes, wait_ms = wait.as_secs_f64() * 1000.0, "Simulating remote write");
        let _gate = self.write_gate.lock().await;
        tokio::time::sleep(wait).await;
    }
}

fn secs_per_byte(direction: &'static str, gbps: f64) -> f64 {
    let gbps = if gbps > 0.0 {
        gbps
    } else {
        warn!(direction, gbps, floor = MIN_THROUGHPUT_GBPS, "Non-positive throughput, clamping");
        MIN_THROUGHPUT_GBPS
    };
    1.0 / (gbps * GIB)
}

fn transfer_time(secs_per_byte: f64, bytes: usize) -> Duration {
    let secs = secs_per_byte * bytes as f64;
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// A remote tier that lives in process memory.
pub struct MockConnector {
    store: AsyncLru,
    pressure: PressureManager,
    local: Arc<dyn StorageBackend>,
    closed: AtomicBool,
}

impl MockConnector {
    /// Returned objects are allocated through `local`.
    pub fn new(config: &RemoteConfig, local: Arc<dyn StorageBackend>) -> Self {
        Self {
            store: AsyncLru::new(config.capacity_bytes),
            pressure: PressureManager::from_config(config),
            local,
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &AsyncLru {
        &self.store
    }

    fn materialize(&self, stored: &StoredObj) -> Option<MemoryObj> {
        let meta = &stored.meta;
        let obj = self
            .local
            .allocate(&meta.shape, meta.dtype, Some(meta.format), true)?;
        obj.write_bytes(&stored.data);
        Some(obj)
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn exists(&self, key: &CacheEngineKey) -> bool {
        self.pressure.on_exists().await;
        self.store.exists(key).await
    }

    async fn get(&self, key: &CacheEngineKey) -> Option<MemoryObj> {
        let stored = self.store.get(key).await?;
        self.pressure.on_get(stored.num_bytes()).await;
        let obj = self.materialize(&stored);
        if obj.is_none() {
            warn!(key = %key, "Failed to allocate memory during remote receive");
        }
        obj
    }

    async fn put(&self, key: CacheEngineKey, obj: &MemoryObj) -> Result<(), ConnectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::Closed);
        }
        let stored = StoredObj::from_obj(obj);
        let bytes = stored.num_bytes();
        self.store.put(key, stored).await?;
        self.pressure.on_put(bytes).await;
        Ok(())
    }

    fn support_batched_get(&self) -> bool {
        true
    }

    async fn batched_get(&self, keys: &[CacheEngineKey]) -> Vec<MemoryObj> {
        let stored = self.store.batched_get(keys).await;
        let total: usize = stored.iter().flatten().map(StoredObj::num_bytes).sum();
        self.pressure.on_get(total).await;

        let mut objs = Vec::with_capacity(keys.len());
        for (i, entry) in stored.iter().enumerate() {
            let Some(entry) = entry else {
                warn!(index = i, requested = keys.len(), "Remote object missing in batched get");
                break;
            };
            let Some(obj) = self.materialize(entry) else {
                warn!(index = i, requested = keys.len(), "Failed to allocate memory in batched get");
                break;
            };
            objs.push(obj);
        }
        if objs.len() < keys.len() {
            warn!(got = objs.len(), requested = keys.len(), "Batched get returned a partial result");
        }
        objs
    }

    async fn list(&self) -> Vec<String> {
        self.store
            .list()
            .await
            .into_iter()
            .map(|k| k.to_string())
            .collect()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.store.clear().await;
    }
}
