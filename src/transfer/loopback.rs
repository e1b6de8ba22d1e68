//! In-process transfer agent.
//!
//! Agents attached to the same [`LoopbackFabric`] can reach each other's
//! registered regions. Transfers copy pages on a background thread, so
//! callers see `Proc` before `Done` just like a real NIC.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::memory::MemoryRegion;
use crate::transfer::agent::{DlistHandle, TransferAgent, XferDesc, XferHandle, XferOp, XferState};
use crate::transfer::TransferError;

/// Registry of the regions every loopback agent has registered.
#[derive(Default)]
pub struct LoopbackFabric {
    regions: Mutex<HashMap<String, Arc<dyn MemoryRegion>>>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(&self, agent: &str, region: Arc<dyn MemoryRegion>) {
        self.regions.lock().insert(agent.to_string(), region);
    }

    fn detach(&self, agent: &str) {
        self.regions.lock().remove(agent);
    }

    fn region(&self, agent: &str) -> Option<Arc<dyn MemoryRegion>> {
        self.regions.lock().get(agent).cloned()
    }
}

#[derive(Serialize, Deserialize)]
struct AgentMeta {
    name: String,
    backends: Vec<String>,
}

struct Dlist {
    /// `None` for the local region.
    agent: Option<String>,
    descs: Vec<XferDesc>,
}

struct Xfer {
    op: XferOp,
    remote_agent: String,
    pairs: Vec<(XferDesc, XferDesc)>,
    state: Arc<Mutex<XferState>>,
}

#[derive(Default)]
struct AgentState {
    region: Option<Arc<dyn MemoryRegion>>,
    remotes: HashSet<String>,
    dlists: HashMap<u64, Dlist>,
    xfers: HashMap<u64, Xfer>,
    next_handle: u64,
}

impl AgentState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct LoopbackAgent {
    name: String,
    backends: Vec<String>,
    fabric: Arc<LoopbackFabric>,
    state: Mutex<AgentState>,
    fail_transfers: AtomicBool,
}

impl LoopbackAgent {
    pub fn new(fabric: Arc<LoopbackFabric>, backends: &[String]) -> Self {
        Self::named(fabric, format!("agent-{}", Uuid::new_v4()), backends)
    }

    pub fn named(fabric: Arc<LoopbackFabric>, name: impl Into<String>, backends: &[String]) -> Self {
        Self {
            name: name.into(),
            backends: backends.to_vec(),
            fabric,
            state: Mutex::new(AgentState::default()),
            fail_transfers: AtomicBool::new(false),
        }
    }

    /// Make every subsequent transfer end in `Err`.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Number of live prepared transfers.
    pub fn open_xfers(&self) -> usize {
        self.state.lock().xfers.len()
    }

    /// Number of live descriptor lists, local included.
    pub fn open_dlists(&self) -> usize {
        self.state.lock().dlists.len()
    }
}

fn select(descs: &[XferDesc], indices: &[usize]) -> Result<Vec<XferDesc>, TransferError> {
    indices
        .iter()
        .map(|&i| {
            descs.get(i).copied().ok_or_else(|| {
                TransferError::Agent(format!("descriptor index {i} out of range ({})", descs.len()))
            })
        })
        .collect()
}

fn copy_span(
    src: &dyn MemoryRegion,
    src_desc: &XferDesc,
    dst: &dyn MemoryRegion,
    dst_desc: &XferDesc,
) -> Result<(), crate::memory::RegionError> {
    let len = src_desc.len.min(dst_desc.len);
    let data = src.read_page(src_desc.addr / src.page_size())?;
    dst.write_page(dst_desc.addr / dst.page_size(), &data[..len.min(data.len())])
}

impl TransferAgent for LoopbackAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn agent_metadata(&self) -> Vec<u8> {
        let meta = AgentMeta {
            name: self.name.clone(),
            backends: self.backends.clone(),
        };
        bincode::serialize(&meta).unwrap_or_default()
    }

    fn add_remote_agent(&self, metadata: &[u8]) -> Result<String, TransferError> {
        let meta: AgentMeta = bincode::deserialize(metadata)?;
        debug!(agent = %self.name, remote = %meta.name, backends = ?meta.backends, "Added remote agent");
        self.state.lock().remotes.insert(meta.name.clone());
        Ok(meta.name)
    }

    fn remove_remote_agent(&self, name: &str) {
        self.state.lock().remotes.remove(name);
    }

    fn register_memory(
        &self,
        region: Arc<dyn MemoryRegion>,
        dev_id: u32,
    ) -> Result<(), TransferError> {
        let mut state = self.state.lock();
        if state.region.is_some() {
            return Err(TransferError::Agent(format!("{} already has registered memory", self.name)));
        }
        debug!(agent = %self.name, pages = region.num_pages(), dev_id, "Registered memory");
        self.fabric.attach(&self.name, region.clone());
        state.region = Some(region);
        Ok(())
    }

    fn deregister_memory(&self) {
        if self.state.lock().region.take().is_some() {
            self.fabric.detach(&self.name);
        }
    }

    fn prep_xfer_dlist(
        &self,
        remote_agent: Option<&str>,
        descs: Vec<XferDesc>,
    ) -> Result<DlistHandle, TransferError> {
        let mut state = self.state.lock();
        if let Some(agent) = remote_agent {
            if !state.remotes.contains(agent) {
                return Err(TransferError::Agent(format!("remote agent {agent} was never added")));
            }
        }
        let id = state.next_handle();
        state.dlists.insert(
            id,
            Dlist {
                agent: remote_agent.map(str::to_string),
                descs,
            },
        );
        Ok(DlistHandle(id))
    }

    fn make_prepped_xfer(
        &self,
        op: XferOp,
        local: DlistHandle,
        local_indices: &[usize],
        remote: DlistHandle,
        remote_indices: &[usize],
    ) -> Result<XferHandle, TransferError> {
        if local_indices.len() != remote_indices.len() {
            return Err(TransferError::IndexMismatch {
                local: local_indices.len(),
                remote: remote_indices.len(),
            });
        }
        let mut state = self.state.lock();
        let unknown = |h: u64| TransferError::Agent(format!("unknown descriptor list {h}"));
        let local_list = state.dlists.get(&local.0).ok_or_else(|| unknown(local.0))?;
        let remote_list = state.dlists.get(&remote.0).ok_or_else(|| unknown(remote.0))?;
        let remote_agent = remote_list
            .agent
            .clone()
            .ok_or_else(|| TransferError::Agent("remote list is not bound to an agent".into()))?;

        let pairs = select(&local_list.descs, local_indices)?
            .into_iter()
            .zip(select(&remote_list.descs, remote_indices)?)
            .collect();

        let id = state.next_handle();
        state.xfers.insert(
            id,
            Xfer {
                op,
                remote_agent,
                pairs,
                state: Arc::new(Mutex::new(XferState::Proc)),
            },
        );
        Ok(XferHandle(id))
    }

    fn transfer(&self, handle: XferHandle) -> Result<XferState, TransferError> {
        let state = self.state.lock();
        let xfer = state
            .xfers
            .get(&handle.0)
            .ok_or_else(|| TransferError::Agent(format!("unknown transfer {}", handle.0)))?;
        let local = state
            .region
            .clone()
            .ok_or_else(|| TransferError::Agent(format!("{} has no registered memory", self.name)))?;
        let remote = self.fabric.region(&xfer.remote_agent).ok_or_else(|| {
            TransferError::Agent(format!("{} has no registered memory", xfer.remote_agent))
        })?;

        if self.fail_transfers.load(Ordering::SeqCst) {
            *xfer.state.lock() = XferState::Err;
            return Ok(XferState::Err);
        }

        let (src, dst) = match xfer.op {
            XferOp::Write => (local, remote),
            XferOp::Read => (remote, local),
        };
        let op = xfer.op;
        let pairs = xfer.pairs.clone();
        let status = xfer.state.clone();
        *status.lock() = XferState::Proc;

        std::thread::spawn(move || {
            let result = pairs.iter().try_for_each(|(local_desc, remote_desc)| match op {
                XferOp::Write => copy_span(src.as_ref(), local_desc, dst.as_ref(), remote_desc),
                XferOp::Read => copy_span(src.as_ref(), remote_desc, dst.as_ref(), local_desc),
            });
            *status.lock() = match result {
                Ok(()) => XferState::Done,
                Err(e) => {
                    error!(error = %e, "Loopback transfer failed");
                    XferState::Err
                }
            };
        });
        Ok(XferState::Proc)
    }

    fn check_xfer_state(&self, handle: XferHandle) -> XferState {
        match self.state.lock().xfers.get(&handle.0) {
            Some(xfer) => *xfer.state.lock(),
            None => XferState::Err,
        }
    }

    fn release_xfer_handle(&self, handle: XferHandle) {
        self.state.lock().xfers.remove(&handle.0);
    }

    fn release_dlist_handle(&self, handle: DlistHandle) {
        self.state.lock().dlists.remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PagedAllocator;
    use crate::transfer::agent::page_descs;

    fn wait_done(agent: &LoopbackAgent, handle: XferHandle) -> XferState {
        for _ in 0..1000 {
            match agent.check_xfer_state(handle) {
                XferState::Proc => std::thread::sleep(std::time::Duration::from_millis(1)),
                other => return other,
            }
        }
        XferState::Proc
    }

    fn pair() -> (LoopbackAgent, PagedAllocator, LoopbackAgent, PagedAllocator) {
        let fabric = LoopbackFabric::new();
        let ucx = vec!["UCX".to_string()];
        let a = LoopbackAgent::named(fabric.clone(), "a", &ucx);
        let b = LoopbackAgent::named(fabric, "b", &ucx);
        let mem_a = PagedAllocator::new(4 * 64, 64);
        let mem_b = PagedAllocator::new(4 * 64, 64);
        a.register_memory(Arc::new(mem_a.clone()), 0).unwrap();
        b.register_memory(Arc::new(mem_b.clone()), 0).unwrap();
        (a, mem_a, b, mem_b)
    }

    #[test]
    fn test_write_copies_pages() {
        let (a, mem_a, b, mem_b) = pair();
        assert_eq!(a.add_remote_agent(&b.agent_metadata()).unwrap(), "b");

        let local = a.prep_xfer_dlist(None, page_descs(&mem_a, 0)).unwrap();
        let remote = a.prep_xfer_dlist(Some("b"), page_descs(&mem_b, 0)).unwrap();
        mem_a.write_page(1, &[9u8; 64]).unwrap();

        let xfer = a
            .make_prepped_xfer(XferOp::Write, local, &[1], remote, &[3])
            .unwrap();
        a.transfer(xfer).unwrap();
        assert_eq!(wait_done(&a, xfer), XferState::Done);
        assert_eq!(mem_b.read_page(3).unwrap(), vec![9u8; 64]);

        a.release_xfer_handle(xfer);
        assert_eq!(a.open_xfers(), 0);
    }

    #[test]
    fn test_remote_dlist_requires_added_agent() {
        let (a, _mem_a, _b, mem_b) = pair();
        let err = a.prep_xfer_dlist(Some("b"), page_descs(&mem_b, 0)).unwrap_err();
        assert!(matches!(err, TransferError::Agent(_)));
    }

    #[test]
    fn test_fault_injection_reports_err() {
        let (a, mem_a, b, mem_b) = pair();
        a.add_remote_agent(&b.agent_metadata()).unwrap();
        let local = a.prep_xfer_dlist(None, page_descs(&mem_a, 0)).unwrap();
        let remote = a.prep_xfer_dlist(Some("b"), page_descs(&mem_b, 0)).unwrap();

        a.set_fail_transfers(true);
        let xfer = a
            .make_prepped_xfer(XferOp::Write, local, &[0], remote, &[0])
            .unwrap();
        assert_eq!(a.transfer(xfer).unwrap(), XferState::Err);
        assert_eq!(a.check_xfer_state(xfer), XferState::Err);
    }
}
