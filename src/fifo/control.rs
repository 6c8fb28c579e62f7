//! The guest-visible control block of one vCPU.

use core::sync::atomic::{AtomicU32, Ordering};

use axerrno::{AxResult, ax_err};
use memory_addr::PAGE_SIZE_4K;

use crate::abi::{EVTCHN_FIFO_CONTROL_BLOCK_SIZE, EVTCHN_FIFO_MAX_QUEUES, EvtchnFifoControlBlock, Port};
use crate::pool::GuestFrame;

/// Required alignment of the control block inside its frame.
const CONTROL_BLOCK_ALIGN: usize = 8;

/// Checks that a control block at `offset` fits inside one page.
pub fn check_offset(offset: usize) -> AxResult {
    if !memory_addr::is_aligned(offset, CONTROL_BLOCK_ALIGN) {
        return ax_err!(InvalidInput, "control block offset misaligned");
    }
    if offset > PAGE_SIZE_4K - EVTCHN_FIFO_CONTROL_BLOCK_SIZE {
        return ax_err!(InvalidInput, "control block crosses a page boundary");
    }
    Ok(())
}

/// A mapped control block.
///
/// The block is a view over the queues' head pointers: the core writes a
/// head when a queue goes from empty to non-empty, the guest advances it as
/// it drains.
pub struct ControlBlock {
    frame: GuestFrame,
    offset: usize,
}

impl ControlBlock {
    /// Places a control block at `offset` inside `frame`.
    ///
    /// Fails if the block would not fit in the page.
    pub fn new(frame: GuestFrame, offset: usize) -> Result<Self, GuestFrame> {
        if check_offset(offset).is_err() {
            return Err(frame);
        }
        Ok(Self { frame, offset })
    }

    fn block(&self) -> &EvtchnFifoControlBlock {
        // SAFETY: `offset` was checked to keep the block inside the mapped,
        // page-aligned frame and to be 8-byte aligned; every field is atomic.
        unsafe {
            &*((self.frame.hva().as_usize() + self.offset) as *const EvtchnFifoControlBlock)
        }
    }

    /// Head slot of the queue for `priority`.
    ///
    /// Panics if `priority` is not below `EVTCHN_FIFO_MAX_QUEUES`.
    #[inline]
    pub fn head(&self, priority: u8) -> &AtomicU32 {
        &self.block().head[priority as usize]
    }

    /// Publishes `port` as the first entry of the queue for `priority`.
    #[inline]
    pub fn set_head(&self, priority: u8, port: Port) {
        self.head(priority).store(port, Ordering::Release);
    }

    /// Marks the queue for `priority` as ready, returning whether it already was.
    #[inline]
    pub fn set_ready(&self, priority: u8) -> bool {
        debug_assert!((priority as usize) < EVTCHN_FIFO_MAX_QUEUES);
        let bit = 1u32 << priority;
        self.block().ready.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Bitmap of ready queues.
    #[inline]
    pub fn ready(&self) -> u32 {
        self.block().ready.load(Ordering::Acquire)
    }

    /// Clears the ready bitmap and every head.
    pub fn reset(&self) {
        let block = self.block();
        block.ready.store(0, Ordering::Release);
        for head in &block.head {
            head.store(0, Ordering::Release);
        }
    }

    /// The frame holding the block.
    pub fn frame(&self) -> &GuestFrame {
        &self.frame
    }

    /// Gives the frame back, so it can be unmapped.
    pub fn into_frame(self) -> GuestFrame {
        self.frame
    }
}

impl core::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("frame", &self.frame)
            .field("offset", &self.offset)
            .field("ready", &format_args!("{:#06x}", self.ready()))
            .finish()
    }
}
