//! Local cache tier.
//!
//! - [`backend`]: StorageBackend contract, controller messages, lookup index hook
//! - [`policy`]: Eviction policies (LRU, FIFO, LFU) over the ordered key table
//! - [`local_cpu`]: The in-memory hot tier with pinning and the eviction loop

pub mod backend;
pub mod local_cpu;
pub mod policy;

pub use backend::{ControllerMsg, KvEventMsg, LookupIndex, StorageBackend};
pub use local_cpu::{LocalCpuBackend, LookupSession};
pub use policy::{CachePolicy, CachePolicyKind};
