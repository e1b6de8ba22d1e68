//! Local CPU backend: the in-memory hot tier.
//!
//! One mutex covers the key table, the policy state, usage accounting and the
//! pending-touch list. Every pin/unpin/evict decision is taken under it.
//! Removal has two entry points: [`StorageBackend::remove`] takes the lock,
//! `remove_locked` expects the caller to hold it (eviction loops).
//!
//! Even with the hot tier disabled (`local_cpu = false`) the backend stays
//! the allocation authority, so `allocate` keeps working while puts are
//! skipped.

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::backend::{
    ControllerMsg, GetTask, KvEventMsg, LookupIndex, PutTask, StorageBackend,
};
use crate::cache::policy::{CachePolicy, CacheTable};
use crate::config::EngineConfig;
use crate::key::CacheEngineKey;
use crate::memory::{DType, MemoryAllocator, MemoryFormat, MemoryObj};

const BACKEND_NAME: &str = "LocalCPUBackend";

struct BackendState {
    table: CacheTable<MemoryObj>,
    policy: Box<dyn CachePolicy<MemoryObj>>,
    /// Bytes held by the table.
    usage: usize,
    /// Keys pinned by `contains(.., pin = true)` since the last `touch`.
    keys_in_request: Vec<CacheEngineKey>,
}

/// The hot tier. Holds exactly one [`MemoryObj`] reference per entry.
pub struct LocalCpuBackend {
    state: Mutex<BackendState>,
    allocator: Arc<dyn MemoryAllocator>,
    lookup_index: Option<Arc<dyn LookupIndex>>,
    controller: Option<mpsc::UnboundedSender<ControllerMsg>>,
    instance_id: String,
    use_hot: bool,
    default_format: MemoryFormat,
}

impl LocalCpuBackend {
    pub fn new(config: &EngineConfig, allocator: Arc<dyn MemoryAllocator>) -> Self {
        let policy = config.cache_policy.build::<MemoryObj>();
        let table = policy.init_table();
        info!(
            policy = policy.name(),
            hot = config.local_cpu,
            capacity = allocator.capacity(),
            "Local CPU backend initialized"
        );
        Self {
            state: Mutex::new(BackendState {
                table,
                policy,
                usage: 0,
                keys_in_request: Vec::new(),
            }),
            allocator,
            lookup_index: None,
            controller: None,
            instance_id: config.instance_id.clone(),
            use_hot: config.local_cpu,
            default_format: config.default_memory_format(),
        }
    }

    /// Keep an external lookup index in sync with evictions.
    pub fn with_lookup_index(mut self, index: Arc<dyn LookupIndex>) -> Self {
        self.lookup_index = Some(index);
        self
    }

    /// Send admission and eviction notices to a cache controller.
    pub fn with_controller(mut self, tx: mpsc::UnboundedSender<ControllerMsg>) -> Self {
        self.controller = Some(tx);
        self
    }

    /// Bytes currently held by the table.
    pub fn usage(&self) -> usize {
        self.state.lock().usage
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    /// Start a lookup whose hits are applied once, when the session ends.
    pub fn lookup_session(&self) -> LookupSession<'_> {
        LookupSession {
            backend: self,
            pending: Vec::new(),
        }
    }

    fn notify(&self, msg: impl FnOnce(KvEventMsg) -> ControllerMsg, key: &CacheEngineKey) {
        let Some(tx) = &self.controller else {
            return;
        };
        let event = KvEventMsg {
            instance_id: self.instance_id.clone(),
            worker_id: key.worker_id(),
            chunk_hash: key.chunk_hash(),
            location: BACKEND_NAME.to_string(),
        };
        if tx.send(msg(event)).is_err() {
            debug!(key = %key, "Controller channel closed, dropping notice");
        }
    }

    fn notify_removed(&self, keys: &[CacheEngineKey]) {
        if keys.is_empty() {
            return;
        }
        if let Some(index) = &self.lookup_index {
            index.batched_remove(keys);
        }
    }

    /// Remove `key` while the caller holds the state lock.
    fn remove_locked(&self, state: &mut BackendState, key: &CacheEngineKey) -> Option<MemoryObj> {
        let obj = state.table.pop(key)?;
        state.policy.update_on_force_evict(key);
        state.usage = state.usage.saturating_sub(obj.num_bytes());
        self.notify(ControllerMsg::Evict, key);
        Some(obj)
    }

    fn put_locked(&self, state: &mut BackendState, key: CacheEngineKey, obj: &MemoryObj) {
        if state.table.contains(&key) {
            return;
        }
        state.usage += obj.num_bytes();
        state.policy.update_on_put(&key);
        self.notify(ControllerMsg::Admit, &key);
        state.table.put(key, obj.clone());
    }

    /// Run the eviction loop until `try_alloc` succeeds or nothing is evictable.
    ///
    /// `expand` maps a candidate to every key that must leave the table with it,
    /// the candidate included.
    fn evict_until<T>(
        &self,
        mut expand: impl FnMut(&CacheEngineKey) -> Vec<CacheEngineKey>,
        mut try_alloc: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        loop {
            let candidates = state.policy.get_evict_candidates(&state.table, 1);
            let Some(candidate) = candidates.into_iter().next() else {
                warn!(
                    entries = state.table.len(),
                    usage = state.usage,
                    "No eviction candidates found in local cpu backend, memory is under pressure"
                );
                return None;
            };

            let mut evicted = Vec::new();
            for key in expand(&candidate) {
                if self.remove_locked(state, &key).is_some() {
                    evicted.push(key);
                }
            }
            self.notify_removed(&evicted);
            debug!(candidate = %candidate, chunks = evicted.len(), "Evicted from cpu memory");

            if let Some(allocated) = try_alloc() {
                return Some(allocated);
            }
        }
    }
}

impl StorageBackend for LocalCpuBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn contains(&self, key: &CacheEngineKey, pin: bool) -> bool {
        let mut state = self.state.lock();
        let Some(obj) = state.table.peek(key) else {
            return false;
        };
        if pin {
            obj.pin();
            state.keys_in_request.push(key.clone());
        }
        true
    }

    fn touch(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pending = std::mem::take(&mut state.keys_in_request);
        for key in pending.iter().rev() {
            state.policy.update_on_hit(key, &mut state.table);
        }
    }

    fn exists_in_put_tasks(&self, _key: &CacheEngineKey) -> bool {
        false
    }

    fn submit_put(&self, key: CacheEngineKey, obj: &MemoryObj) -> Option<PutTask> {
        let mut guard = self.state.lock();
        self.put_locked(&mut guard, key, obj);
        None
    }

    fn batched_submit_put(
        &self,
        keys: Vec<CacheEngineKey>,
        objs: &[MemoryObj],
    ) -> Option<Vec<PutTask>> {
        if !self.use_hot {
            return None;
        }
        let mut guard = self.state.lock();
        for (key, obj) in keys.into_iter().zip(objs) {
            self.put_locked(&mut guard, key, obj);
        }
        None
    }

    fn get_blocking(&self, key: &CacheEngineKey) -> Option<MemoryObj> {
        self.state.lock().table.peek(key).cloned()
    }

    fn get_non_blocking(&self, key: &CacheEngineKey) -> Option<GetTask> {
        let obj = self.get_blocking(key)?;
        Some(futures::future::ready(Some(obj)).boxed())
    }

    fn pin(&self, key: &CacheEngineKey) -> bool {
        match self.state.lock().table.peek(key) {
            Some(obj) => {
                obj.pin();
                true
            }
            None => false,
        }
    }

    fn unpin(&self, key: &CacheEngineKey) -> bool {
        match self.state.lock().table.peek(key) {
            Some(obj) => {
                obj.unpin();
                true
            }
            None => false,
        }
    }

    fn remove(&self, key: &CacheEngineKey) -> bool {
        let removed = {
            let mut guard = self.state.lock();
            self.remove_locked(&mut guard, key)
        };
        removed.is_some()
    }

    fn allocate(
        &self,
        shape: &[usize],
        dtype: DType,
        fmt: Option<MemoryFormat>,
        eviction: bool,
    ) -> Option<MemoryObj> {
        let fmt = fmt.unwrap_or(self.default_format);
        let obj = self.allocator.allocate(shape, dtype, fmt);
        if obj.is_some() || !eviction {
            return obj;
        }
        self.evict_until(
            |candidate| vec![candidate.clone()],
            || self.allocator.allocate(shape, dtype, fmt),
        )
    }

    fn batched_allocate(
        &self,
        shape: &[usize],
        dtype: DType,
        batch_size: usize,
        fmt: Option<MemoryFormat>,
        eviction: bool,
    ) -> Option<Vec<MemoryObj>> {
        let fmt = fmt.unwrap_or(self.default_format);
        let objs = self.allocator.batched_allocate(shape, dtype, batch_size, fmt);
        if objs.is_some() || !eviction {
            return objs;
        }
        // batch_size is the layer count. All layers of a candidate are assumed
        // to share its pin state, so they leave the table together.
        self.evict_until(
            |candidate| {
                let mut keys = vec![candidate.clone()];
                keys.extend(
                    candidate
                        .split_layers(batch_size)
                        .into_iter()
                        .filter(|k| k != candidate),
                );
                keys
            },
            || self.allocator.batched_allocate(shape, dtype, batch_size, fmt),
        )
    }

    fn get_keys(&self) -> Vec<CacheEngineKey> {
        let state = self.state.lock();
        state.table.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    fn clear(&self) -> usize {
        if !self.use_hot {
            return 0;
        }
        let mut cleared_tokens = 0;
        let mut cleared = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let evictable: Vec<CacheEngineKey> = state
                .table
                .iter()
                .filter(|(_, obj)| obj.can_evict())
                .map(|(k, _)| k.clone())
                .collect();
            for key in evictable {
                if let Some(obj) = self.remove_locked(state, &key) {
                    cleared_tokens += obj.num_tokens();
                    cleared.push(key);
                }
            }
        }
        self.notify_removed(&cleared);
        debug!(entries = cleared.len(), tokens = cleared_tokens, "Cleared local cpu backend");
        cleared_tokens
    }

    fn close(&self) {
        let tokens = self.clear();
        info!(tokens, "Local CPU backend closed");
    }
}

/// A caller-owned buffer of pending hits for one logical lookup.
///
/// Pins are recorded as the lookup checks keys; the policy's hit bookkeeping
/// runs once, in reverse pin order, when the session finishes or drops.
pub struct LookupSession<'a> {
    backend: &'a LocalCpuBackend,
    pending: Vec<CacheEngineKey>,
}

impl LookupSession<'_> {
    pub fn contains(&mut self, key: &CacheEngineKey, pin: bool) -> bool {
        let state = self.backend.state.lock();
        let Some(obj) = state.table.peek(key) else {
            return false;
        };
        if pin {
            obj.pin();
            self.pending.push(key.clone());
        }
        true
    }

    /// Keys pinned so far, in pin order.
    pub fn pinned(&self) -> &[CacheEngineKey] {
        &self.pending
    }

    pub fn finish(mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut guard = self.backend.state.lock();
        let state = &mut *guard;
        for key in self.pending.drain(..).rev() {
            state.policy.update_on_hit(&key, &mut state.table);
        }
    }
}

impl Drop for LookupSession<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
