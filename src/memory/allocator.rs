//! Paged host memory allocator.
//!
//! Manages a pre-allocated buffer as a pool of fixed-size pages with an O(1)
//! free list. Objects take `ceil(num_bytes / page_size)` pages. The arena of
//! live objects (reference and pin counts) sits behind the same lock as the
//! free list, so allocate/free can race with each other freely.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::memory::object::{DType, MemoryFormat, MemoryObj, MemoryObjMeta, ObjectId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("Page {index} out of range (region has {num_pages} pages)")]
    PageOutOfRange { index: usize, num_pages: usize },

    #[error("Write of {len} bytes exceeds page size {page_size}")]
    PageOverflow { len: usize, page_size: usize },
}

/// Hands out [`MemoryObj`]s. Implementations must be thread-safe.
pub trait MemoryAllocator: Send + Sync {
    /// Allocate one object, or `None` when there is not enough free memory.
    fn allocate(&self, shape: &[usize], dtype: DType, fmt: MemoryFormat) -> Option<MemoryObj>;

    /// Allocate `batch_size` identical objects, all or nothing.
    fn batched_allocate(
        &self,
        shape: &[usize],
        dtype: DType,
        batch_size: usize,
        fmt: MemoryFormat,
    ) -> Option<Vec<MemoryObj>>;

    /// Total capacity in bytes.
    fn capacity(&self) -> usize;

    /// Bytes currently free.
    fn free_bytes(&self) -> usize;
}

/// A registered, page-addressable memory region.
pub trait MemoryRegion: Send + Sync {
    fn page_size(&self) -> usize;

    fn num_pages(&self) -> usize;

    fn read_page(&self, index: usize) -> Result<Vec<u8>, RegionError>;

    fn write_page(&self, index: usize, data: &[u8]) -> Result<(), RegionError>;

    /// Whether `obj` was allocated from this region.
    fn owns(&self, obj: &MemoryObj) -> bool;
}

#[derive(Debug)]
struct Slot {
    ref_count: usize,
    pin_count: usize,
    pages: Arc<[usize]>,
}

#[derive(Debug)]
struct PoolState {
    free_list: VecDeque<usize>,
    slots: HashMap<ObjectId, Slot>,
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    page_size: usize,
    num_pages: usize,
    state: Mutex<PoolState>,
    data: RwLock<Vec<u8>>,
}

impl PoolShared {
    pub(crate) fn ref_up(&self, id: ObjectId) {
        if let Some(slot) = self.state.lock().slots.get_mut(&id) {
            slot.ref_count += 1;
        }
    }

    pub(crate) fn ref_down(&self, id: ObjectId) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(&id) else {
            return;
        };
        slot.ref_count -= 1;
        if slot.ref_count > 0 {
            return;
        }
        if let Some(slot) = state.slots.remove(&id) {
            if slot.pin_count > 0 {
                warn!(%id, pin_count = slot.pin_count, "Freeing pinned memory object");
            }
            state.free_list.extend(slot.pages.iter().copied());
            debug!(%id, pages = slot.pages.len(), "Freed memory object");
        }
    }

    pub(crate) fn ref_count(&self, id: ObjectId) -> usize {
        self.state.lock().slots.get(&id).map_or(0, |s| s.ref_count)
    }

    pub(crate) fn pin_count(&self, id: ObjectId) -> usize {
        self.state.lock().slots.get(&id).map_or(0, |s| s.pin_count)
    }

    pub(crate) fn pin(&self, id: ObjectId) {
        if let Some(slot) = self.state.lock().slots.get_mut(&id) {
            slot.pin_count += 1;
        }
    }

    pub(crate) fn unpin(&self, id: ObjectId) {
        if let Some(slot) = self.state.lock().slots.get_mut(&id) {
            if slot.pin_count == 0 {
                warn!(%id, "Unpin of an object that is not pinned");
                return;
            }
            slot.pin_count -= 1;
        }
    }

    pub(crate) fn write_pages(&self, pages: &[usize], data: &[u8]) {
        let mut buf = self.data.write();
        for (page, chunk) in pages.iter().zip(data.chunks(self.page_size)) {
            let start = page * self.page_size;
            buf[start..start + chunk.len()].copy_from_slice(chunk);
        }
    }

    pub(crate) fn read_pages(&self, pages: &[usize], len: usize) -> Vec<u8> {
        let buf = self.data.read();
        let mut out = Vec::with_capacity(len);
        for page in pages {
            let remaining = len - out.len();
            if remaining == 0 {
                break;
            }
            let start = page * self.page_size;
            let take = remaining.min(self.page_size);
            out.extend_from_slice(&buf[start..start + take]);
        }
        out
    }

    fn pages_for(&self, num_bytes: usize) -> usize {
        num_bytes.div_ceil(self.page_size).max(1)
    }

    fn check_page(&self, index: usize) -> Result<(), RegionError> {
        if index >= self.num_pages {
            return Err(RegionError::PageOutOfRange {
                index,
                num_pages: self.num_pages,
            });
        }
        Ok(())
    }
}

/// Fixed-capacity paged allocator.
///
/// Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct PagedAllocator {
    shared: Arc<PoolShared>,
}

impl PagedAllocator {
    /// Create a pool of `capacity / page_size` pages.
    pub fn new(capacity: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let num_pages = capacity / page_size;
        Self {
            shared: Arc::new(PoolShared {
                page_size,
                num_pages,
                state: Mutex::new(PoolState {
                    free_list: (0..num_pages).collect(),
                    slots: HashMap::new(),
                }),
                data: RwLock::new(vec![0u8; num_pages * page_size]),
            }),
        }
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Number of free pages.
    pub fn free_pages(&self) -> usize {
        self.shared.state.lock().free_list.len()
    }

    /// Fraction of pages in use (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.shared.num_pages == 0 {
            return 0.0;
        }
        1.0 - self.free_pages() as f64 / self.shared.num_pages as f64
    }

    fn take(&self, state: &mut PoolState, meta: &Arc<MemoryObjMeta>, n: usize) -> MemoryObj {
        let pages: Arc<[usize]> = state.free_list.drain(..n).collect();
        let id = ObjectId::next();
        state.slots.insert(
            id,
            Slot {
                ref_count: 1,
                pin_count: 0,
                pages: pages.clone(),
            },
        );
        MemoryObj::new(id, meta.clone(), pages, self.shared.clone())
    }
}

impl MemoryAllocator for PagedAllocator {
    fn allocate(&self, shape: &[usize], dtype: DType, fmt: MemoryFormat) -> Option<MemoryObj> {
        let meta = Arc::new(MemoryObjMeta::new(shape, dtype, fmt));
        let needed = self.shared.pages_for(meta.num_bytes);

        let mut state = self.shared.state.lock();
        if state.free_list.len() < needed {
            return None;
        }
        let obj = self.take(&mut state, &meta, needed);
        debug!(id = %obj.id(), pages = needed, "Allocated memory object");
        Some(obj)
    }

    fn batched_allocate(
        &self,
        shape: &[usize],
        dtype: DType,
        batch_size: usize,
        fmt: MemoryFormat,
    ) -> Option<Vec<MemoryObj>> {
        let meta = Arc::new(MemoryObjMeta::new(shape, dtype, fmt));
        let needed = self.shared.pages_for(meta.num_bytes);

        let mut state = self.shared.state.lock();
        if state.free_list.len() < needed * batch_size {
            return None;
        }
        let objs = (0..batch_size)
            .map(|_| self.take(&mut state, &meta, needed))
            .collect();
        Some(objs)
    }

    fn capacity(&self) -> usize {
        self.shared.num_pages * self.shared.page_size
    }

    fn free_bytes(&self) -> usize {
        self.free_pages() * self.shared.page_size
    }
}

impl MemoryRegion for PagedAllocator {
    fn page_size(&self) -> usize {
        self.shared.page_size
    }

    fn num_pages(&self) -> usize {
        self.shared.num_pages
    }

    fn read_page(&self, index: usize) -> Result<Vec<u8>, RegionError> {
        self.shared.check_page(index)?;
        let start = index * self.shared.page_size;
        Ok(self.shared.data.read()[start..start + self.shared.page_size].to_vec())
    }

    fn write_page(&self, index: usize, data: &[u8]) -> Result<(), RegionError> {
        self.shared.check_page(index)?;
        if data.len() > self.shared.page_size {
            return Err(RegionError::PageOverflow {
                len: data.len(),
                page_size: self.shared.page_size,
            });
        }
        let start = index * self.shared.page_size;
        self.shared.data.write()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
    fn owns(&self, obj: &MemoryObj) -> bool {
        obj.is_from(&self.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: [usize; 3] = [2, 16, 32]; // 1024 elements

    #[test]
    fn test_allocate_and_free() {
        // 4 pages of 2 KiB; each fp16 object needs exactly one page.
        let alloc = PagedAllocator::new(4 * 2048, 2048);

        let objs: Vec<_> = (0..4)
            .map(|_| alloc.allocate(&SHAPE, DType::Half, MemoryFormat::Kv2Td).unwrap())
            .collect();
        assert_eq!(alloc.free_pages(), 0);
        assert!(alloc.allocate(&SHAPE, DType::Half, MemoryFormat::Kv2Td).is_none());

        drop(objs);
        assert_eq!(alloc.free_pages(), 4);
        assert_eq!(alloc.live_objects(), 0);
    }

    #[test]
    fn test_owns_only_own_objects() {
        let alloc = PagedAllocator::new(2048, 2048);
        let other = PagedAllocator::new(2048, 2048);
        let obj = alloc.allocate(&SHAPE, DType::Half, MemoryFormat::Kv2Td).unwrap();

        assert!(alloc.owns(&obj));
        assert!(alloc.clone().owns(&obj));
        assert!(!other.owns(&obj));
    }

    #[test]
    fn test_clone_keeps_pages_alive() {
        let alloc = PagedAllocator::new(2048, 2048);
        let obj = alloc.allocate(&SHAPE, DType::Half, MemoryFormat::Kv2Td).unwrap();
        let other = obj.clone();
        assert_eq!(obj.ref_count(), 2);

        drop(obj);
        assert_eq!(other.ref_count(), 1);
        assert_eq!(alloc.free_pages(), 0);

        drop(other);
        assert_eq!(alloc.free_pages(), 1);
    }

    #[test]
    fn test_multi_page_object_roundtrips_bytes() {
        let alloc = PagedAllocator::new(8 * 512, 512);
        let obj = alloc.allocate(&SHAPE, DType::Half, MemoryFormat::Kv2Td).unwrap();
        assert_eq!(obj.page_indices().len(), 4);

        let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        assert_eq!(obj.write_bytes(&data), 2048);
        assert_eq!(obj.read_bytes(), data);
    }

    #[test]
    fn test_batched_allocate_all_or_nothing() {
        let alloc = PagedAllocator::new(3 * 2048, 2048);
        assert!(alloc
            .batched_allocate(&SHAPE, DType::Half, 4, MemoryFormat::KvT2d)
            .is_none());
        assert_eq!(alloc.free_pages(), 3);

        let objs = alloc
            .batched_allocate(&SHAPE, DType::Half, 3, MemoryFormat::KvT2d)
            .unwrap();
        assert_eq!(objs.len(), 3);
        assert_eq!(alloc.free_pages(), 0);
    }

    #[test]
    fn test_pin_is_independent_of_refs() {
        let alloc = PagedAllocator::new(2048, 2048);
        let obj = alloc.allocate(&SHAPE, DType::Half, MemoryFormat::Kv2Td).unwrap();
        obj.pin();
        assert!(!obj.can_evict());
        assert_eq!(obj.ref_count(), 1);
        obj.unpin();
        obj.unpin();
        assert_eq!(obj.pin_count(), 0);
        assert!(obj.can_evict());
    }

    #[test]
    fn test_region_bounds() {
        let alloc = PagedAllocator::new(2 * 64, 64);
        assert!(alloc.write_page(1, &[7u8; 64]).is_ok());
        assert_eq!(alloc.read_page(1).unwrap(), vec![7u8; 64]);
        assert_eq!(
            alloc.read_page(2),
            Err(RegionError::PageOutOfRange {
                index: 2,
                num_pages: 2
            })
        );
        assert!(alloc.write_page(0, &[0u8; 65]).is_err());
    }
}
