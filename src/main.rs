//! kv-cache-offload node.
//!
//! Brings up the local CPU tier, the background executors, the simulated
//! remote tier and, when a handshake address is configured, an RDMA channel
//! that peers can connect to. Runs until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use kv_cache_offload::cache::{ControllerMsg, LocalCpuBackend, StorageBackend};
use kv_cache_offload::config::{Cli, Config};
use kv_cache_offload::connector::{MockConnector, RemoteConnector};
use kv_cache_offload::executor::{AsyncPqExecutor, AsyncPqThreadPoolExecutor};
use kv_cache_offload::memory::{MemoryAllocator, PagedAllocator};
use kv_cache_offload::transfer::{LoopbackAgent, LoopbackFabric, RdmaChannel, TransferChannel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_cache_offload=debug"
    } else {
        "kv_cache_offload=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("kv-cache-offload v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(url) = cli.peer_init_url {
        config.channel.peer_init_url = Some(url);
    }
    let config = Arc::new(config);

    info!(
        instance_id = %config.engine.instance_id,
        chunk_size = config.engine.chunk_size,
        max_local_cpu_size = config.engine.max_local_cpu_size,
        policy = ?config.engine.cache_policy,
        format = ?config.engine.default_memory_format(),
        "Configuration loaded"
    );

    // Host memory shared by the local tier and the RDMA channel.
    let allocator = PagedAllocator::new(config.engine.max_local_cpu_size, config.engine.page_size);
    info!(capacity = allocator.capacity(), page_size = config.engine.page_size, "Allocator ready");

    let (controller_tx, mut controller_rx) = mpsc::unbounded_channel::<ControllerMsg>();
    let controller = tokio::spawn(async move {
        while let Some(msg) = controller_rx.recv().await {
            let event = msg.event();
            debug!(
                kind = if matches!(msg, ControllerMsg::Admit(_)) { "admit" } else { "evict" },
                worker_id = event.worker_id,
                chunk_hash = event.chunk_hash,
                location = %event.location,
                "Controller notice"
            );
        }
    });

    let backend = Arc::new(
        LocalCpuBackend::new(&config.engine, Arc::new(allocator.clone()))
            .with_controller(controller_tx),
    );

    let async_executor = AsyncPqExecutor::new(config.executor.max_workers);
    let blocking_executor = AsyncPqThreadPoolExecutor::new(config.executor.max_workers);

    let remote = MockConnector::new(&config.remote, backend.clone());
    info!(capacity = remote.store().capacity(), "Mock remote tier ready");

    let channel = match &config.channel.peer_init_url {
        Some(_) => {
            let agent = Arc::new(LoopbackAgent::new(LoopbackFabric::new(), &config.channel.backends));
            let channel = RdmaChannel::new(agent, Arc::new(allocator.clone()), &config.channel).await?;
            if let Some(addr) = channel.local_init_addr() {
                info!(%addr, agent = channel.agent_name(), "Accepting peer handshakes");
            }
            Some(channel)
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    async_executor.shutdown(true).await;
    blocking_executor.shutdown(true).await;
    if let Some(channel) = &channel {
        channel.close();
    }
    remote.close().await;
    backend.close();

    drop(remote);
    drop(backend);
    let _ = controller.await;

    Ok(())
}
