//! The transfer channel contract.
//!
//! Send/recv are two-sided and must be called in matched pairs on opposite
//! ends. Read/write are one-sided and address remote memory through a
//! [`TransferSpec`]. Every batched call returns how many objects moved,
//! which may be fewer than requested; callers must check.

use async_trait::async_trait;

use crate::memory::MemoryObj;
use crate::transfer::{TransferError, TransferSpec};

#[async_trait]
pub trait TransferChannel: Send + Sync {
    fn batched_send(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    fn batched_recv(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    async fn async_batched_send(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    async fn async_batched_recv(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    /// Push `objs` into the peer's buffers named by `spec`.
    fn batched_write(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    /// Fill `objs` from the peer's buffers named by `spec`.
    fn batched_read(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    async fn async_batched_write(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    async fn async_batched_read(
        &self,
        objs: &[MemoryObj],
        spec: Option<&TransferSpec>,
    ) -> Result<usize, TransferError>;

    /// Release the channel's resources. Later calls are no-ops.
    fn close(&self);
}
