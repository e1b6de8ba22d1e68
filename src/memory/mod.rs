//! Host memory for cached objects.
//!
//! - [`object`]: MemoryObj handles, formats and dtypes
//! - [`allocator`]: Paged allocator and the region interface used by transfer agents

pub mod allocator;
pub mod object;

pub use allocator::{MemoryAllocator, MemoryRegion, PagedAllocator, RegionError};
pub use object::{DType, MemoryFormat, MemoryObj, MemoryObjMeta, ObjectId};
