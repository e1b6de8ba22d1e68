//! kv-cache-offload: local-tier KV-cache storage and inter-node transfer.
//!
//! Holds computed attention-cache chunks in a capacity-bounded host memory
//! tier, serves them back, and moves them to remote stores and peer nodes
//! without blocking the serving path:
//!   key → memory object → local CPU tier → executor / transfer channel → peer

pub mod cache;
pub mod config;
pub mod connector;
pub mod executor;
pub mod key;
pub mod memory;
pub mod transfer;
