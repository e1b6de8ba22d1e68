//! Moving cache objects between tiers and peers.
//!
//! - [`channel`]: The batched send/recv/read/write contract
//! - [`agent`]: Data-plane agent abstraction (metadata, descriptor lists, prepared transfers)
//! - [`loopback`]: In-process agent used for tests and single-host setups
//! - [`handshake`]: Control-socket protocol that exchanges agent metadata and descriptors
//! - [`rdma`]: Zero-copy channel built on an agent and the handshake

pub mod agent;
pub mod channel;
pub mod handshake;
pub mod loopback;
pub mod rdma;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::ObjectId;

pub use agent::{TransferAgent, XferState};
pub use channel::TransferChannel;
pub use loopback::{LoopbackAgent, LoopbackFabric};
pub use rdma::RdmaChannel;

/// Addresses a batched transfer on a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSpec {
    /// Peer the data goes to or comes from, as registered by the handshake.
    pub peer_id: String,
    /// One remote buffer index per local page, in order.
    pub remote_indices: Vec<usize>,
}

impl TransferSpec {
    pub fn new(peer_id: impl Into<String>, remote_indices: Vec<usize>) -> Self {
        Self {
            peer_id: peer_id.into(),
            remote_indices,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{0} requires a transfer spec")]
    MissingTransferSpec(&'static str),

    #[error("Unknown peer {0:?}; run the handshake first")]
    UnknownPeer(String),

    #[error("Index count mismatch: {local} local buffers, {remote} remote indices")]
    IndexMismatch { local: usize, remote: usize },

    #[error("Transfer with peer {peer} failed")]
    TransferFailed { peer: String },

    #[error("{0} is not supported by this channel")]
    Unsupported(&'static str),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake with {url} timed out after {timeout:?}")]
    HandshakeTimeout { url: String, timeout: Duration },

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} does not belong to the registered memory region")]
    ForeignObject(ObjectId),

    #[error("Channel is closed")]
    Closed,

    #[error("Transfer agent error: {0}")]
    Agent(String),
}
