//! Control-socket handshake for the RDMA channel.
//!
//! The requester connects and sends, in this order:
//!
//! 1. `InitRequest` with its agent metadata; the responder adds it as a
//!    remote agent and answers with its own metadata.
//! 2. `MemRegRequest`; the responder answers with its serialized
//!    descriptor list.
//!
//! A `MemRegRequest` on a connection that has not completed step 1 is
//! answered with `Rejected`. Frames are a 4-byte big-endian length followed
//! by a bincode payload.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::transfer::agent::TransferAgent;
use crate::transfer::TransferError;

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMsg {
    InitRequest { local_meta: Bytes },
    InitResponse { remote_meta: Bytes },
    MemRegRequest,
    MemRegResponse { remote_descriptor_list: Bytes },
    Rejected { reason: String },
}

impl HandshakeMsg {
    fn kind(&self) -> &'static str {
        match self {
            HandshakeMsg::InitRequest { .. } => "InitRequest",
            HandshakeMsg::InitResponse { .. } => "InitResponse",
            HandshakeMsg::MemRegRequest => "MemRegRequest",
            HandshakeMsg::MemRegResponse { .. } => "MemRegResponse",
            HandshakeMsg::Rejected { .. } => "Rejected",
        }
    }
}

pub async fn write_msg<W>(writer: &mut W, msg: &HandshakeMsg) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| TransferError::Handshake(format!("frame of {} bytes too large", payload.len())))?;
    writer.write_u32(len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_msg<R>(reader: &mut R) -> Result<HandshakeMsg, TransferError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(TransferError::Handshake(format!("frame of {len} bytes too large")));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Accepts `tcp://host:port` or a bare `host:port`.
pub fn socket_addr(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

/// Answers handshake requests on behalf of the local agent.
pub struct Responder {
    agent: Arc<dyn TransferAgent>,
    local_descs: Bytes,
}

impl Responder {
    pub fn new(agent: Arc<dyn TransferAgent>, local_descs: Bytes) -> Self {
        Self { agent, local_descs }
    }

    /// Reply to one request. `remote_agent` is this connection's state.
    pub fn respond(&self, remote_agent: &mut Option<String>, msg: HandshakeMsg) -> HandshakeMsg {
        match msg {
            HandshakeMsg::InitRequest { local_meta } => {
                match self.agent.add_remote_agent(&local_meta) {
                    Ok(name) => {
                        debug!(agent = %self.agent.name(), remote = %name, "Handshake init");
                        *remote_agent = Some(name);
                        HandshakeMsg::InitResponse {
                            remote_meta: Bytes::from(self.agent.agent_metadata()),
                        }
                    }
                    Err(e) => HandshakeMsg::Rejected {
                        reason: format!("cannot add remote agent: {e}"),
                    },
                }
            }
            HandshakeMsg::MemRegRequest => match remote_agent {
                Some(name) => {
                    debug!(agent = %self.agent.name(), remote = %name, "Handshake memreg");
                    HandshakeMsg::MemRegResponse {
                        remote_descriptor_list: self.local_descs.clone(),
                    }
                }
                None => HandshakeMsg::Rejected {
                    reason: "MemRegRequest before InitRequest".to_string(),
                },
            },
            other => HandshakeMsg::Rejected {
                reason: format!("unexpected {} from requester", other.kind()),
            },
        }
    }
}

async fn serve_connection(responder: Arc<Responder>, mut stream: TcpStream, peer: SocketAddr) {
    let mut remote_agent = None;
    loop {
        let request = match read_msg(&mut stream).await {
            Ok(msg) => msg,
            Err(TransferError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(%peer, "Handshake connection closed");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "Dropping handshake connection");
                return;
            }
        };
        let reply = responder.respond(&mut remote_agent, request);
        if let HandshakeMsg::Rejected { reason } = &reply {
            warn!(%peer, reason = %reason, "Rejected handshake request");
        }
        if let Err(e) = write_msg(&mut stream, &reply).await {
            warn!(%peer, error = %e, "Failed to send handshake reply");
            return;
        }
    }
}

/// Background task accepting handshake connections. Stops on drop.
pub struct HandshakeListener {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HandshakeListener {
    pub async fn bind(url: &str, responder: Responder) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(socket_addr(url)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, Arc::new(responder), shutdown_rx));
        info!(addr = %local_addr, "Handshake listener started");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the accept loop to stop; open connections are dropped.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Stop and wait for the accept loop to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HandshakeListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    responder: Arc<Responder>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted handshake connection");
                    connections.spawn(serve_connection(responder.clone(), stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "Handshake accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
    debug!("Handshake listener stopped");
}

/// Requester side of the handshake.
pub struct HandshakeClient {
    stream: TcpStream,
    url: String,
}

impl HandshakeClient {
    pub async fn connect(url: &str) -> Result<Self, TransferError> {
        let stream = TcpStream::connect(socket_addr(url)).await?;
        Ok(Self {
            stream,
            url: url.to_string(),
        })
    }

    /// Exchange agent metadata; returns the responder's.
    pub async fn init(&mut self, local_meta: Bytes) -> Result<Bytes, TransferError> {
        match self.request(HandshakeMsg::InitRequest { local_meta }).await? {
            HandshakeMsg::InitResponse { remote_meta } => Ok(remote_meta),
            other => Err(self.unexpected(other)),
        }
    }

    /// Fetch the responder's serialized descriptor list.
    pub async fn mem_reg(&mut self) -> Result<Bytes, TransferError> {
        match self.request(HandshakeMsg::MemRegRequest).await? {
            HandshakeMsg::MemRegResponse {
                remote_descriptor_list,
            } => Ok(remote_descriptor_list),
            other => Err(self.unexpected(other)),
        }
    }

    async fn request(&mut self, msg: HandshakeMsg) -> Result<HandshakeMsg, TransferError> {
        write_msg(&mut self.stream, &msg).await?;
        read_msg(&mut self.stream).await
    }

    fn unexpected(&self, reply: HandshakeMsg) -> TransferError {
        match reply {
            HandshakeMsg::Rejected { reason } => {
                TransferError::Handshake(format!("{} rejected request: {reason}", self.url))
            }
            other => TransferError::Handshake(format!("{} sent unexpected {}", self.url, other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = HandshakeMsg::MemRegResponse {
            remote_descriptor_list: Bytes::from_static(&[1, 2, 3]),
        };
        write_msg(&mut a, &msg).await.unwrap();
        assert_eq!(read_msg(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
        assert!(matches!(read_msg(&mut b).await, Err(TransferError::Handshake(_))));
    }

    #[test]
    fn test_socket_addr_strips_scheme() {
        assert_eq!(socket_addr("tcp://127.0.0.1:5555"), "127.0.0.1:5555");
        assert_eq!(socket_addr("localhost:1"), "localhost:1");
    }
}
