//! Transfer agent abstraction.
//!
//! An agent owns the data-plane side of an RDMA-style transport: it exports
//! metadata peers use to reach it, registers local memory, turns descriptor
//! lists into prepared handles and runs transfers whose status is polled.
//! The channel drives it; the handshake only moves its opaque blobs around.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::memory::MemoryRegion;
use crate::transfer::TransferError;

/// Status of an issued transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferState {
    /// Completed successfully.
    Done,
    /// Still in flight.
    Proc,
    /// Failed; the batch is lost.
    Err,
}

/// Direction of a prepared transfer, from the local side's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferOp {
    Read,
    Write,
}

/// One addressable span inside a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferDesc {
    /// Byte offset in the region.
    pub addr: usize,
    pub len: usize,
    pub dev_id: u32,
}

/// Prepared descriptor list, local or bound to a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DlistHandle(pub u64);

/// Prepared transfer between two descriptor lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XferHandle(pub u64);

pub trait TransferAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Opaque blob a peer passes to its own `add_remote_agent`.
    fn agent_metadata(&self) -> Vec<u8>;

    /// Make a peer reachable; returns its agent name.
    fn add_remote_agent(&self, metadata: &[u8]) -> Result<String, TransferError>;

    fn remove_remote_agent(&self, name: &str);

    fn register_memory(&self, region: Arc<dyn MemoryRegion>, dev_id: u32)
        -> Result<(), TransferError>;

    fn deregister_memory(&self);

    /// Prepare `descs` on the local region (`None`) or on a remote agent's.
    fn prep_xfer_dlist(
        &self,
        remote_agent: Option<&str>,
        descs: Vec<XferDesc>,
    ) -> Result<DlistHandle, TransferError>;

    /// Pair `local_indices` of `local` with `remote_indices` of `remote`.
    fn make_prepped_xfer(
        &self,
        op: XferOp,
        local: DlistHandle,
        local_indices: &[usize],
        remote: DlistHandle,
        remote_indices: &[usize],
    ) -> Result<XferHandle, TransferError>;

    /// Start the transfer. Completion is observed through `check_xfer_state`.
    fn transfer(&self, handle: XferHandle) -> Result<XferState, TransferError>;

    fn check_xfer_state(&self, handle: XferHandle) -> XferState;

    fn release_xfer_handle(&self, handle: XferHandle);

    fn release_dlist_handle(&self, handle: DlistHandle);

    fn serialize_descs(&self, descs: &[XferDesc]) -> Result<Vec<u8>, TransferError> {
        Ok(bincode::serialize(descs)?)
    }

    fn deserialize_descs(&self, bytes: &[u8]) -> Result<Vec<XferDesc>, TransferError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One descriptor per page of `region`, in page order.
pub fn page_descs(region: &dyn MemoryRegion, dev_id: u32) -> Vec<XferDesc> {
    let page_size = region.page_size();
    (0..region.num_pages())
        .map(|page| XferDesc {
            addr: page * page_size,
            len: page_size,
            dev_id,
        })
        .collect()
}
