//! The storage-backend contract and the messages backends emit.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::key::CacheEngineKey;
use crate::memory::{DType, MemoryFormat, MemoryObj};

/// A put that completes in the background.
pub type PutTask = BoxFuture<'static, anyhow::Result<()>>;

/// A get that resolves to the object, or `None` if it vanished meanwhile.
pub type GetTask = BoxFuture<'static, Option<MemoryObj>>;

/// Operations every storage tier offers to the orchestration layer.
///
/// Misses are reported as `false`/`None`, never as errors.
pub trait StorageBackend: Send + Sync {
    /// Name used as the location in controller messages.
    fn name(&self) -> &str;

    /// Whether `key` is stored. With `pin`, the entry is also pinned and its
    /// hit bookkeeping is deferred until [`StorageBackend::touch`].
    fn contains(&self, key: &CacheEngineKey, pin: bool) -> bool;

    /// Apply deferred hit bookkeeping for keys pinned since the last call.
    fn touch(&self);

    /// Whether a put for `key` is still in flight. Check together with `contains`.
    fn exists_in_put_tasks(&self, key: &CacheEngineKey) -> bool;

    /// Store `obj` under `key`. Never overwrites an existing entry.
    fn submit_put(&self, key: CacheEngineKey, obj: &MemoryObj) -> Option<PutTask>;

    fn batched_submit_put(
        &self,
        keys: Vec<CacheEngineKey>,
        objs: &[MemoryObj],
    ) -> Option<Vec<PutTask>>;

    /// A new reference to the stored object.
    fn get_blocking(&self, key: &CacheEngineKey) -> Option<MemoryObj>;

    fn get_non_blocking(&self, key: &CacheEngineKey) -> Option<GetTask>;

    fn pin(&self, key: &CacheEngineKey) -> bool;

    fn unpin(&self, key: &CacheEngineKey) -> bool;

    fn remove(&self, key: &CacheEngineKey) -> bool;

    /// Allocate an object, evicting entries if `eviction` is set and memory is short.
    fn allocate(
        &self,
        shape: &[usize],
        dtype: DType,
        fmt: Option<MemoryFormat>,
        eviction: bool,
    ) -> Option<MemoryObj>;

    /// Allocate `batch_size` objects (one per layer), evicting whole
    /// multi-layer entries if needed.
    fn batched_allocate(
        &self,
        shape: &[usize],
        dtype: DType,
        batch_size: usize,
        fmt: Option<MemoryFormat>,
        eviction: bool,
    ) -> Option<Vec<MemoryObj>>;

    /// Keys in eviction order, least-recently-used first.
    fn get_keys(&self) -> Vec<CacheEngineKey>;

    /// Drop every evictable entry; returns the number of tokens freed.
    fn clear(&self) -> usize;

    fn close(&self);
}

/// Receives removals so an external prefix-lookup index stays consistent.
pub trait LookupIndex: Send + Sync {
    fn batched_remove(&self, keys: &[CacheEngineKey]);
}

/// Payload shared by admission and eviction notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEventMsg {
    pub instance_id: String,
    pub worker_id: u32,
    pub chunk_hash: i64,
    pub location: String,
}

/// Fire-and-forget notices for the worker-side cache controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerMsg {
    Admit(KvEventMsg),
    Evict(KvEventMsg),
}

impl ControllerMsg {
    pub fn event(&self) -> &KvEventMsg {
        match self {
            ControllerMsg::Admit(ev) | ControllerMsg::Evict(ev) => ev,
        }
    }
}
