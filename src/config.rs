//! Runtime configuration for kv-cache-offload.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file is fine.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::policy::CachePolicyKind;
use crate::memory::MemoryFormat;

/// Values that parse but cannot run.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("max_local_cpu_size ({size}) is smaller than one page ({page_size})")]
    BudgetBelowPage { size: usize, page_size: usize },

    #[error("{field} must be a positive number, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("channel.backends is empty")]
    NoBackends,
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-cache-offload", about = "KV-cache local tier and transfer node")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Handshake listen address; overrides `channel.peer_init_url`.
    #[arg(long)]
    pub peer_init_url: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local cache engine settings.
    pub engine: EngineConfig,

    /// Background job executor settings.
    pub executor: ExecutorConfig,

    /// Peer transfer channel settings.
    pub channel: ChannelConfig,

    /// Simulated remote tier settings.
    pub remote: RemoteConfig,
}

/// Local CPU tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifies this engine in controller messages.
    pub instance_id: String,

    /// Tokens per cached chunk.
    pub chunk_size: usize,

    /// Keep objects in the local CPU tier (the hot cache).
    pub local_cpu: bool,

    /// Host memory budget in bytes.
    pub max_local_cpu_size: usize,

    /// Allocator page size in bytes; also the transfer descriptor granularity.
    pub page_size: usize,

    /// Eviction policy.
    pub cache_policy: CachePolicyKind,

    /// Store one object per layer.
    pub use_layerwise: bool,

    /// Use the blending layout for layer-wise objects.
    pub enable_blending: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: "kv_cache_default_instance".to_string(),
            chunk_size: 256,
            local_cpu: true,
            max_local_cpu_size: 5 * 1024 * 1024 * 1024, // 5 GB
            page_size: 4096,
            cache_policy: CachePolicyKind::Lru,
            use_layerwise: false,
            enable_blending: false,
        }
    }
}

impl EngineConfig {
    /// Format used when a caller does not name one.
    pub fn default_memory_format(&self) -> MemoryFormat {
        match (self.use_layerwise, self.enable_blending) {
            (true, true) => MemoryFormat::Kv2Td,
            (true, false) => MemoryFormat::KvT2d,
            (false, _) => MemoryFormat::Kv2Ltd,
        }
    }
}

/// Priority job executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker tasks per executor.
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// RDMA-style transfer channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Address to accept handshakes on (e.g. "tcp://0.0.0.0:5555"). None = no listener.
    pub peer_init_url: Option<String>,

    /// Tensor-parallel rank; recorded as the device id in descriptors.
    pub tp_rank: u32,

    /// Transport backends requested from the agent.
    pub backends: Vec<String>,

    /// Sleep between transfer status polls, in microseconds.
    pub poll_interval_us: u64,

    /// Upper bound for a full handshake, in milliseconds. None = wait forever.
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            peer_init_url: None,
            tp_rank: 0,
            backends: vec!["UCX".to_string()],
            poll_interval_us: 1000,
            handshake_timeout_ms: Some(30_000),
        }
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

/// Throughput-simulated remote tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Capacity in bytes.
    pub capacity_bytes: usize,

    /// Latency charged to every existence check, in milliseconds.
    pub peeking_latency_ms: f64,

    /// Read bandwidth in GB/s.
    pub read_throughput_gbps: f64,

    /// Write bandwidth in GB/s.
    pub write_throughput_gbps: f64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            peeking_latency_ms: 1.0,
            read_throughput_gbps: 2.0,
            write_throughput_gbps: 2.0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when it is missing.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        for (field, value) in [
            ("engine.chunk_size", engine.chunk_size),
            ("engine.page_size", engine.page_size),
            ("executor.max_workers", self.executor.max_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if engine.max_local_cpu_size < engine.page_size {
            return Err(ConfigError::BudgetBelowPage {
                size: engine.max_local_cpu_size,
                page_size: engine.page_size,
            });
        }
        if self.channel.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        let remote = &self.remote;
        for (field, value) in [
            ("remote.read_throughput_gbps", remote.read_throughput_gbps),
            ("remote.write_throughput_gbps", remote.write_throughput_gbps),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        Ok(())
    }
}
