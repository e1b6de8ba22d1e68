//! RDMA channel tests over loopback agents and real handshake sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use kv_cache_offload::config::ChannelConfig;
use kv_cache_offload::memory::{DType, MemoryAllocator, MemoryFormat, MemoryObj, MemoryRegion, PagedAllocator};
use kv_cache_offload::transfer::handshake::HandshakeClient;
use kv_cache_offload::transfer::{
    LoopbackAgent, LoopbackFabric, RdmaChannel, TransferAgent, TransferChannel, TransferError,
    TransferSpec,
};

const PAGE: usize = 64;
const PAGES: usize = 8;

struct Node {
    agent: Arc<LoopbackAgent>,
    memory: PagedAllocator,
    channel: RdmaChannel,
}

impl Node {
    async fn start(fabric: &Arc<LoopbackFabric>, name: &str) -> Self {
        let config = ChannelConfig {
            peer_init_url: Some("tcp://127.0.0.1:0".to_string()),
            poll_interval_us: 100,
            ..ChannelConfig::default()
        };
        let agent = Arc::new(LoopbackAgent::named(fabric.clone(), name, &config.backends));
        let memory = PagedAllocator::new(PAGES * PAGE, PAGE);
        let channel = RdmaChannel::new(agent.clone(), Arc::new(memory.clone()), &config)
            .await
            .unwrap();
        Self {
            agent,
            memory,
            channel,
        }
    }

    fn url(&self) -> String {
        format!("tcp://{}", self.channel.local_init_addr().unwrap())
    }

    /// One-page object filled with `byte`.
    fn object(&self, byte: u8) -> MemoryObj {
        let obj = self
            .memory
            .allocate(&[PAGE / 2], DType::Half, MemoryFormat::Binary)
            .unwrap();
        obj.write_bytes(&[byte; PAGE]);
        obj
    }
}

async fn connected_pair() -> (Node, Node) {
    let fabric = LoopbackFabric::new();
    let a = Node::start(&fabric, "node-a").await;
    let b = Node::start(&fabric, "node-b").await;
    a.channel.lazy_init_peer_connection("node-b", &b.url()).await.unwrap();
    (a, b)
}

#[tokio::test]
async fn test_handshake_both_directions() {
    let (a, b) = connected_pair().await;
    b.channel.lazy_init_peer_connection("node-a", &a.url()).await.unwrap();

    assert_eq!(a.channel.remote_descriptor_count("node-b"), Some(PAGES));
    assert_eq!(b.channel.remote_descriptor_count("node-a"), Some(PAGES));

    // Repeating is a no-op.
    a.channel.lazy_init_peer_connection("node-b", &b.url()).await.unwrap();
    assert!(a.channel.has_peer("node-b"));
}

#[tokio::test]
async fn test_memreg_before_init_is_rejected() {
    let fabric = LoopbackFabric::new();
    let responder = Node::start(&fabric, "responder").await;
    let requester = LoopbackAgent::named(fabric, "requester", &["UCX".to_string()]);

    let mut client = HandshakeClient::connect(&responder.url()).await.unwrap();
    let err = client.mem_reg().await.unwrap_err();
    assert!(matches!(err, TransferError::Handshake(_)), "{err}");

    // The connection survives and the proper order still works.
    let meta = client.init(Bytes::from(requester.agent_metadata())).await.unwrap();
    assert_eq!(requester.add_remote_agent(&meta).unwrap(), "responder");
    let descs = client.mem_reg().await.unwrap();
    assert_eq!(requester.deserialize_descs(&descs).unwrap().len(), PAGES);
}

#[tokio::test]
async fn test_write_moves_bytes_to_peer() {
    let (a, b) = connected_pair().await;
    let objs = vec![a.object(0xAB), a.object(0xCD)];
    let spec = TransferSpec::new("node-b", vec![5, 2]);

    let sent = a.channel.async_batched_write(&objs, Some(&spec)).await.unwrap();
    assert_eq!(sent, 2);
    assert_eq!(b.memory.read_page(5).unwrap(), vec![0xAB; PAGE]);
    assert_eq!(b.memory.read_page(2).unwrap(), vec![0xCD; PAGE]);
    assert_eq!(a.agent.open_xfers(), 0);
}

#[tokio::test]
async fn test_blocking_write_and_read() {
    let (a, b) = connected_pair().await;
    let spec = TransferSpec::new("node-b", vec![7]);

    let out = a.object(0x11);
    assert_eq!(a.channel.batched_write(&[out], Some(&spec)).unwrap(), 1);
    assert_eq!(b.memory.read_page(7).unwrap(), vec![0x11; PAGE]);

    b.memory.write_page(7, &[0x22; PAGE]).unwrap();
    let into = a.object(0);
    assert_eq!(a.channel.batched_read(std::slice::from_ref(&into), Some(&spec)).unwrap(), 1);
    assert_eq!(into.read_bytes(), vec![0x22; PAGE]);
}

#[tokio::test]
async fn test_failed_transfer_surfaces_error() {
    let (a, _b) = connected_pair().await;
    a.agent.set_fail_transfers(true);

    let objs = vec![a.object(1)];
    let err = a
        .channel
        .async_batched_write(&objs, Some(&TransferSpec::new("node-b", vec![0])))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::TransferFailed { ref peer } if peer == "node-b"));
    assert_eq!(a.agent.open_xfers(), 0);
}

#[tokio::test]
async fn test_write_argument_errors() {
    let (a, _b) = connected_pair().await;
    let objs = vec![a.object(1)];

    assert!(matches!(
        a.channel.batched_write(&objs, None),
        Err(TransferError::MissingTransferSpec(_))
    ));
    assert!(matches!(
        a.channel.batched_write(&objs, Some(&TransferSpec::new("nobody", vec![0]))),
        Err(TransferError::UnknownPeer(_))
    ));
    assert!(matches!(
        a.channel.batched_write(&objs, Some(&TransferSpec::new("node-b", vec![0, 1]))),
        Err(TransferError::IndexMismatch { local: 1, remote: 2 })
    ));
    assert_eq!(
        a.channel
            .batched_write(&[], Some(&TransferSpec::new("node-b", vec![])))
            .unwrap(),
        0
    );
    assert!(matches!(
        a.channel.async_batched_send(&objs, None).await,
        Err(TransferError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_close_releases_everything_once() {
    let (a, _b) = connected_pair().await;
    assert_eq!(a.agent.open_dlists(), 2);

    a.channel.close();
    a.channel.close();
    assert_eq!(a.agent.open_dlists(), 0);

    let objs = vec![a.object(1)];
    assert!(matches!(
        a.channel.batched_write(&objs, Some(&TransferSpec::new("node-b", vec![0]))),
        Err(TransferError::Closed)
    ));
}

#[tokio::test]
async fn test_cancelled_writes_release_handles() {
    let (a, b) = connected_pair().await;
    let objs = vec![a.object(0x5A)];
    let spec = TransferSpec::new("node-b", vec![3]);

    for _ in 0..20 {
        let _ = tokio::time::timeout(
            Duration::ZERO,
            a.channel.async_batched_write(&objs, Some(&spec)),
        )
        .await;
    }
    assert_eq!(a.channel.in_flight(), 0);
    assert_eq!(a.agent.open_xfers(), 0);

    // The channel is still usable afterwards.
    assert_eq!(a.channel.async_batched_write(&objs, Some(&spec)).await.unwrap(), 1);
    assert_eq!(b.memory.read_page(3).unwrap(), vec![0x5A; PAGE]);

    a.channel.close();
    assert_eq!(a.agent.open_xfers(), 0);
}

#[tokio::test]
async fn test_close_releases_abandoned_transfers() {
    let (a, _b) = connected_pair().await;
    let objs = vec![a.object(1)];
    let spec = TransferSpec::new("node-b", vec![0]);

    let mut write = Box::pin(a.channel.async_batched_write(&objs, Some(&spec)));
    if futures::poll!(write.as_mut()).is_pending() {
        assert_eq!(a.channel.in_flight(), 1);
        // Leaked without running its destructor.
        std::mem::forget(write);
        a.channel.close();
        assert_eq!(a.channel.in_flight(), 0);
    } else {
        drop(write);
        a.channel.close();
    }
    assert_eq!(a.agent.open_xfers(), 0);
}

#[tokio::test]
async fn test_object_from_other_pool_is_rejected() {
    let (a, b) = connected_pair().await;
    let foreign = b.object(0x77);
    let spec = TransferSpec::new("node-b", vec![4]);

    let objs = vec![a.object(1), foreign.clone()];
    let err = a
        .channel
        .async_batched_write(&objs, Some(&TransferSpec::new("node-b", vec![4, 5])))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::ForeignObject(id) if id == foreign.id()), "{err}");
    assert!(matches!(
        a.channel.batched_read(std::slice::from_ref(&foreign), Some(&spec)),
        Err(TransferError::ForeignObject(_))
    ));
    assert_eq!(a.agent.open_xfers(), 0);
    assert_eq!(b.memory.read_page(4).unwrap(), vec![0; PAGE]);
}

#[tokio::test]
async fn test_handshake_times_out_on_silent_peer() {
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let _hold = tokio::spawn(async move {
        let (stream, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let fabric = LoopbackFabric::new();
    let config = ChannelConfig {
        handshake_timeout_ms: Some(100),
        ..ChannelConfig::default()
    };
    let agent = Arc::new(LoopbackAgent::named(fabric, "impatient", &config.backends));
    let memory = PagedAllocator::new(PAGES * PAGE, PAGE);
    let channel = RdmaChannel::new(agent, Arc::new(memory), &config).await.unwrap();
    assert!(channel.local_init_addr().is_none());

    let err = channel
        .lazy_init_peer_connection("silent", &format!("tcp://{addr}"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::HandshakeTimeout { .. }));
    assert!(!channel.has_peer("silent"));
}
