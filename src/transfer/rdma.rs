//! RDMA-style transfer channel.
//!
//! The channel registers the local memory region with a [`TransferAgent`],
//! prepares one descriptor per page and optionally listens for handshakes.
//! Peers become addressable through [`RdmaChannel::lazy_init_peer_connection`],
//! after which one-sided writes and reads move pages without any call on the
//! remote side.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::config::ChannelConfig;
use crate::memory::{MemoryObj, MemoryRegion};
use crate::transfer::agent::{page_descs, DlistHandle, TransferAgent, XferHandle, XferOp, XferState};
use crate::transfer::channel::TransferChannel;
use crate::transfer::handshake::{HandshakeClient, HandshakeListener, Responder};
use crate::transfer::{TransferError, TransferSpec};

/// Descriptor list prepared for one peer.
#[derive(Debug, Clone)]
struct RemotePeer {
    agent_name: String,
    dlist: DlistHandle,
    num_descs: usize,
}

pub struct RdmaChannel {
    agent: Arc<dyn TransferAgent>,
    region: Arc<dyn MemoryRegion>,
    local_dlist: DlistHandle,
    poll_interval: Duration,
    handshake_timeout: Option<Duration>,
    remote_peers: Mutex<HashMap<String, RemotePeer>>,
    listener: Mutex<Option<HandshakeListener>>,
    /// Issued transfers whose handle has not been released yet.
    in_flight: Mutex<HashSet<XferHandle>>,
    closed: AtomicBool,
}

/// Releases the transfer handle when the waiting call finishes or is dropped.
struct InFlight<'a> {
    channel: &'a RdmaChannel,
    handle: XferHandle,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.channel.release_xfer(self.handle);
    }
}

impl RdmaChannel {
    /// Register `region` with `agent` and, if `peer_init_url` is set, start
    /// answering handshakes on it.
    pub async fn new(
        agent: Arc<dyn TransferAgent>,
        region: Arc<dyn MemoryRegion>,
        config: &ChannelConfig,
    ) -> Result<Self, TransferError> {
        let descs = page_descs(region.as_ref(), config.tp_rank);
        let num_descs = descs.len();
        agent.register_memory(region.clone(), config.tp_rank)?;
        let serialized = Bytes::from(agent.serialize_descs(&descs)?);
        let local_dlist = agent.prep_xfer_dlist(None, descs)?;

        let listener = match &config.peer_init_url {
            Some(url) => {
                let responder = Responder::new(agent.clone(), serialized);
                Some(HandshakeListener::bind(url, responder).await?)
            }
            None => None,
        };

        info!(
            agent = %agent.name(),
            descs = num_descs,
            listening = ?listener.as_ref().map(HandshakeListener::local_addr),
            "RDMA channel ready"
        );

        Ok(Self {
            agent,
            region,
            local_dlist,
            poll_interval: config.poll_interval(),
            handshake_timeout: config.handshake_timeout(),
            remote_peers: Mutex::new(HashMap::new()),
            listener: Mutex::new(listener),
            in_flight: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Address the handshake listener is bound to, if any.
    pub fn local_init_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(HandshakeListener::local_addr)
    }

    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.remote_peers.lock().contains_key(peer_id)
    }

    /// Number of remote descriptors held for `peer_id`.
    pub fn remote_descriptor_count(&self, peer_id: &str) -> Option<usize> {
        self.remote_peers.lock().get(peer_id).map(|p| p.num_descs)
    }

    /// Handshake with the peer listening on `init_url` and remember it as
    /// `peer_id`. No-op if the peer is already known.
    pub async fn lazy_init_peer_connection(
        &self,
        peer_id: &str,
        init_url: &str,
    ) -> Result<(), TransferError> {
        self.ensure_open()?;
        if self.has_peer(peer_id) {
            return Ok(());
        }

        let handshake = self.handshake(peer_id, init_url);
        let peer = match self.handshake_timeout {
            Some(timeout) => tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| TransferError::HandshakeTimeout {
                    url: init_url.to_string(),
                    timeout,
                })??,
            None => handshake.await?,
        };

        let replaced = self.remote_peers.lock().insert(peer_id.to_string(), peer);
        if let Some(old) = replaced {
            self.agent.release_dlist_handle(old.dlist);
        }
        Ok(())
    }

    async fn handshake(&self, peer_id: &str, init_url: &str) -> Result<RemotePeer, TransferError> {
        let mut client = HandshakeClient::connect(init_url).await?;

        let remote_meta = client.init(Bytes::from(self.agent.agent_metadata())).await?;
        let agent_name = self.agent.add_remote_agent(&remote_meta)?;
        debug!(peer_id, remote = %agent_name, "Peer metadata registered");

        let descs_bytes = client.mem_reg().await?;
        let descs = self.agent.deserialize_descs(&descs_bytes)?;
        let num_descs = descs.len();
        let dlist = self.agent.prep_xfer_dlist(Some(&agent_name), descs)?;
        info!(peer_id, remote = %agent_name, descs = num_descs, "Peer connection initialized");

        Ok(RemotePeer {
            agent_name,
            dlist,
            num_descs,
        })
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::Closed);
        }
        Ok(())
    }

    /// Transfers issued and not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Release `handle` unless `close` already did.
    fn release_xfer(&self, handle: XferHandle) {
        if self.in_flight.lock().remove(&handle) {
            self.agent.release_xfer_handle(handle);
        }
    }

    /// Build and issue the transfer. `None` for an empty batch.
    fn start(
        &self,
        op: XferOp,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
        what: &'static str,
    ) -> Result<Option<(InFlight<'_>, String)>, TransferError> {
        self.ensure_open()?;
        let spec = spec.ok_or(TransferError::MissingTransferSpec(what))?;
        if objs.is_empty() {
            return Ok(None);
        }
        let peer = self
            .remote_peers
            .lock()
            .get(&spec.peer_id)
            .cloned()
            .ok_or_else(|| TransferError::UnknownPeer(spec.peer_id.clone()))?;
        if let Some(obj) = objs.iter().find(|obj| !self.region.owns(obj)) {
            return Err(TransferError::ForeignObject(obj.id()));
        }

        let local_indices: Vec<usize> = objs
            .iter()
            .flat_map(|obj| obj.page_indices().iter().copied())
            .collect();
        if local_indices.len() != spec.remote_indices.len() {
            return Err(TransferError::IndexMismatch {
                local: local_indices.len(),
                remote: spec.remote_indices.len(),
            });
        }

        let handle = self.agent.make_prepped_xfer(
            op,
            self.local_dlist,
            &local_indices,
            peer.dlist,
            &spec.remote_indices,
        )?;
        {
            // Checked under the set's lock so `close` cannot miss the handle.
            let mut in_flight = self.in_flight.lock();
            if self.closed.load(Ordering::SeqCst) {
                self.agent.release_xfer_handle(handle);
                return Err(TransferError::Closed);
            }
            in_flight.insert(handle);
        }
        let guard = InFlight {
            channel: self,
            handle,
        };
        self.agent.transfer(handle)?;
        debug!(?op, peer = %spec.peer_id, remote = %peer.agent_name, objects = objs.len(), pages = local_indices.len(), "Transfer issued");
        Ok(Some((guard, spec.peer_id.clone())))
    }

    /// One status check. `Some` once the transfer has finished either way.
    fn settle(
        &self,
        handle: XferHandle,
        peer: &str,
        count: usize,
    ) -> Option<Result<usize, TransferError>> {
        if !self.in_flight.lock().contains(&handle) {
            return Some(Err(TransferError::Closed));
        }
        match self.agent.check_xfer_state(handle) {
            XferState::Proc => {
                trace!(peer, "Transfer in progress");
                None
            }
            XferState::Done => Some(Ok(count)),
            XferState::Err => {
                error!(peer, objects = count, "Transfer failed");
                Some(Err(TransferError::TransferFailed {
                    peer: peer.to_string(),
                }))
            }
        }
    }

    fn run_blocking(
        &self,
        op: XferOp,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
        what: &'static str,
    ) -> Result<usize, TransferError> {
        let Some((xfer, peer)) = self.start(op, objs, spec, what)? else {
            return Ok(0);
        };
        loop {
            if let Some(result) = self.settle(xfer.handle, &peer, objs.len()) {
                return result;
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    async fn run_async(
        &self,
        op: XferOp,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
        what: &'static str,
    ) -> Result<usize, TransferError> {
        let Some((xfer, peer)) = self.start(op, objs, spec, what)? else {
            return Ok(0);
        };
        loop {
            if let Some(result) = self.settle(xfer.handle, &peer, objs.len()) {
                return result;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl TransferChannel for RdmaChannel {
    fn batched_send(
        &self,
        _objs: &[MemoryObj],
        _spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        Err(TransferError::Unsupported("batched_send"))
    }

    fn batched_recv(
        &self,
        _objs: &[MemoryObj],
        _spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        Err(TransferError::Unsupported("batched_recv"))
    }

    async fn async_batched_send(
        &self,
        _objs: &[MemoryObj],
        _spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        Err(TransferError::Unsupported("async_batched_send"))
    }

    async fn async_batched_recv(
        &self,
        _objs: &[MemoryObj],
        _spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        Err(TransferError::Unsupported("async_batched_recv"))
    }

    fn batched_write(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        self.run_blocking(XferOp::Write, objs, spec, "batched_write")
    }

    fn batched_read(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        self.run_blocking(XferOp::Read, objs, spec, "batched_read")
    }

    async fn async_batched_write(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        self.run_async(XferOp::Write, objs, spec, "async_batched_write")
            .await
    }

    async fn async_batched_read(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError> {
        self.run_async(XferOp::Read, objs, spec, "async_batched_read")
            .await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop();
        }
        let pending: Vec<XferHandle> = self.in_flight.lock().drain().collect();
        if !pending.is_empty() {
            debug!(transfers = pending.len(), "Releasing in-flight transfers");
        }
        for handle in pending {
            self.agent.release_xfer_handle(handle);
        }
        for (peer_id, peer) in self.remote_peers.lock().drain() {
            self.agent.release_dlist_handle(peer.dlist);
            self.agent.remove_remote_agent(&peer.agent_name);
            debug!(peer_id = %peer_id, "Released peer descriptors");
        }
        self.agent.release_dlist_handle(self.local_dlist);
        self.agent.deregister_memory();
        info!(agent = %self.agent.name(), "RDMA channel closed");
    }
}

impl Drop for RdmaChannel {
    fn drop(&mut self) {
        self.close();
    }
}
