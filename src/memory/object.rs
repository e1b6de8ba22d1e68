//! Memory object handles and their metadata.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::memory::allocator::PoolShared;

/// Element type of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Half,
    Bfloat16,
    Float,
    Double,
    Fp8,
    Fp8E4m3,
    Fp8E5m2,
}

impl DType {
    /// Bytes per element.
    pub fn size(&self) -> usize {
        match self {
            DType::Half | DType::Bfloat16 => 2,
            DType::Float => 4,
            DType::Double => 8,
            DType::Fp8 | DType::Fp8E4m3 | DType::Fp8E5m2 => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Half => "half",
            DType::Bfloat16 => "bfloat16",
            DType::Float => "float",
            DType::Double => "double",
            DType::Fp8 => "fp8",
            DType::Fp8E4m3 => "fp8_e4m3",
            DType::Fp8E5m2 => "fp8_e5m2",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical layout of the KV data inside an object.
///
/// Downstream consumers switch on this, so the variants are part of the
/// external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryFormat {
    #[serde(rename = "UNDEFINED")]
    Undefined,
    /// `[2, num_layers, num_tokens, hidden]`
    #[serde(rename = "KV_2LTD")]
    Kv2Ltd,
    /// `[num_tokens, 2, hidden]`, one object per layer.
    #[serde(rename = "KV_T2D")]
    KvT2d,
    /// `[2, num_tokens, hidden]`, one object per layer, blending layout.
    #[serde(rename = "KV_2TD")]
    Kv2Td,
    /// Opaque serialized bytes.
    #[serde(rename = "BINARY")]
    Binary,
}

impl MemoryFormat {
    /// Token count implied by `shape` for this layout.
    pub fn num_tokens(&self, shape: &[usize]) -> usize {
        let dim = match self {
            MemoryFormat::Kv2Ltd => 2,
            MemoryFormat::KvT2d => 0,
            MemoryFormat::Kv2Td => 1,
            MemoryFormat::Undefined | MemoryFormat::Binary => return 0,
        };
        shape.get(dim).copied().unwrap_or(0)
    }
}

/// Immutable description of an object's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryObjMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub format: MemoryFormat,
    pub num_bytes: usize,
    pub num_tokens: usize,
}

impl MemoryObjMeta {
    pub fn new(shape: &[usize], dtype: DType, format: MemoryFormat) -> Self {
        let num_bytes = shape.iter().product::<usize>() * dtype.size();
        Self {
            shape: shape.to_vec(),
            dtype,
            format,
            num_bytes,
            num_tokens: format.num_tokens(shape),
        }
    }
}

/// Opaque arena id of an allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(0);

impl ObjectId {
    pub(crate) fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// A counted reference to an allocated object.
///
/// Cloning takes another reference and dropping releases one; the pages go
/// back to the allocator when the last reference is dropped. Pinning is
/// tracked separately and only affects eviction eligibility.
pub struct MemoryObj {
    id: ObjectId,
    meta: Arc<MemoryObjMeta>,
    pages: Arc<[usize]>,
    pool: Arc<PoolShared>,
}

impl MemoryObj {
    pub(crate) fn new(
        id: ObjectId,
        meta: Arc<MemoryObjMeta>,
        pages: Arc<[usize]>,
        pool: Arc<PoolShared>,
    ) -> Self {
        Self {
            id,
            meta,
            pages,
            pool,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn meta(&self) -> &MemoryObjMeta {
        &self.meta
    }

    pub fn num_bytes(&self) -> usize {
        self.meta.num_bytes
    }

    pub fn num_tokens(&self) -> usize {
        self.meta.num_tokens
    }

    pub fn format(&self) -> MemoryFormat {
        self.meta.format
    }

    /// Index of the first backing page.
    pub fn address(&self) -> usize {
        self.pages[0]
    }

    /// All backing page indices, in data order.
    pub fn page_indices(&self) -> &[usize] {
        &self.pages
    }

    pub(crate) fn is_from(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    pub fn ref_count(&self) -> usize {
        self.pool.ref_count(self.id)
    }

    pub fn pin_count(&self) -> usize {
        self.pool.pin_count(self.id)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn can_evict(&self) -> bool {
        !self.is_pinned()
    }

    pub fn pin(&self) {
        self.pool.pin(self.id);
    }

    pub fn unpin(&self) {
        self.pool.unpin(self.id);
    }

    /// Copy `data` into the object's pages, truncated to `num_bytes`.
    /// Returns the number of bytes written.
    pub fn write_bytes(&self, data: &[u8]) -> usize {
        let len = data.len().min(self.meta.num_bytes);
        self.pool.write_pages(&self.pages, &data[..len]);
        len
    }

    /// The object's `num_bytes` bytes of content.
    pub fn read_bytes(&self) -> Vec<u8> {
        self.pool.read_pages(&self.pages, self.meta.num_bytes)
    }
}

impl Clone for MemoryObj {
    fn clone(&self) -> Self {
        self.pool.ref_up(self.id);
        Self {
            id: self.id,
            meta: self.meta.clone(),
            pages: self.pages.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for MemoryObj {
    fn drop(&mut self) {
        self.pool.ref_down(self.id);
    }
}

impl fmt::Debug for MemoryObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObj")
            .field("id", &self.id)
            .field("format", &self.meta.format)
            .field("num_bytes", &self.meta.num_bytes)
            .field("pages", &self.pages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_sizes() {
        let meta = MemoryObjMeta::new(&[2, 4, 256, 128], DType::Half, MemoryFormat::Kv2Ltd);
        assert_eq!(meta.num_bytes, 2 * 4 * 256 * 128 * 2);
        assert_eq!(meta.num_tokens, 256);

        let meta = MemoryObjMeta::new(&[256, 2, 128], DType::Bfloat16, MemoryFormat::KvT2d);
        assert_eq!(meta.num_tokens, 256);

        let meta = MemoryObjMeta::new(&[2, 64, 128], DType::Float, MemoryFormat::Kv2Td);
        assert_eq!(meta.num_tokens, 64);
        assert_eq!(meta.num_bytes, 2 * 64 * 128 * 4);
    }

    #[test]
    fn test_format_serde_names() {
        assert_eq!(serde_json::to_string(&MemoryFormat::Kv2Ltd).unwrap(), "\"KV_2LTD\"");
        assert_eq!(serde_json::to_string(&DType::Fp8E4m3).unwrap(), "\"fp8_e4m3\"");
    }
}
