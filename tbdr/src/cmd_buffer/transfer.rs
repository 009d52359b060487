//! Buffer transfers.
use crate::{
    cmd_buffer::{CommandBuffer, SubCmdType, TransferOp},
    memory::{DevAddr, Heap},
    Result,
};
use tracing::trace_span;

/// Largest update accepted by [`CommandBuffer::update_buffer`], in bytes.
pub const MAX_UPDATE_BUFFER_SIZE: u64 = 65536;

impl CommandBuffer {
    pub fn copy_buffer(&mut self, src: DevAddr, dst: DevAddr, size: u64) -> Result<()> {
        let _span = trace_span!("copy_buffer", size).entered();
        self.record(|cb| cb.add_transfer_op(TransferOp::CopyBuffer { src, dst, size }))
    }

    /// Fills `size` bytes at `dst` with the repeated 32-bit `data`.
    pub fn fill_buffer(&mut self, dst: DevAddr, size: u64, data: u32) -> Result<()> {
        let _span = trace_span!("fill_buffer", size).entered();
        debug_assert_eq!(size % 4, 0);
        self.record(|cb| cb.add_transfer_op(TransferOp::FillBuffer { dst, size, data }))
    }

    /// Writes `data` to `dst`. The data is staged in memory owned by the command buffer.
    pub fn update_buffer(&mut self, dst: DevAddr, data: &[u32]) -> Result<()> {
        let _span = trace_span!("update_buffer").entered();
        let size = data.len() as u64 * 4;
        debug_assert!(size <= MAX_UPDATE_BUFFER_SIZE);
        self.record(|cb| {
            let src = cb.upload(Heap::Transfer, data)?;
            cb.add_transfer_op(TransferOp::UpdateBuffer { src, dst, size })
        })
    }

    fn add_transfer_op(&mut self, op: TransferOp) -> Result<()> {
        self.start_sub_cmd(SubCmdType::Transfer)?;
        if let Some(transfer) = self.current.as_mut().and_then(|s| s.as_transfer_mut()) {
            transfer.ops.push(op);
        }
        Ok(())
    }
}
