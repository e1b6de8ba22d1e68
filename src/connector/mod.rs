//! Remote tier connectors.
//!
//! - [`mock`]: Capacity-bounded in-memory remote store with simulated bandwidth

pub mod mock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::key::CacheEngineKey;
use crate::memory::MemoryObj;

pub use mock::{AsyncLru, MockConnector, PressureManager};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// The object can never fit, regardless of what is evicted.
    #[error("Object of {size} bytes exceeds remote capacity of {capacity} bytes")]
    ObjectTooLarge { size: usize, capacity: usize },

    #[error("Connector is closed")]
    Closed,
}

/// A remote store reachable from the local tier.
///
/// Returned objects are allocated through the local backend, so a `None`
/// can mean either a miss or local memory pressure.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn exists(&self, key: &CacheEngineKey) -> bool;

    async fn get(&self, key: &CacheEngineKey) -> Option<MemoryObj>;

    async fn put(&self, key: CacheEngineKey, obj: &MemoryObj) -> Result<(), ConnectorError>;

    fn support_batched_get(&self) -> bool {
        false
    }

    /// Fetch `keys` in order, stopping at the first failure. A short result
    /// is a partial failure.
    async fn batched_get(&self, keys: &[CacheEngineKey]) -> Vec<MemoryObj> {
        let mut objs = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(key).await {
                Some(obj) => objs.push(obj),
                None => {
                    warn!(got = objs.len(), requested = keys.len(), "Batched get stopped early");
                    break;
                }
            }
        }
        objs
    }

    /// Stored keys in their canonical string form.
    async fn list(&self) -> Vec<String>;

    async fn close(&self);
}
