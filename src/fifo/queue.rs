//! Per-vCPU priority queues of pending ports.
//!
//! Each vCPU owns one singly-linked FIFO per priority. The links live in the
//! event words themselves and the head lives in the vCPU's control block, so
//! the queue structure here only remembers the tail.
//!
//! ```text
//!  control block          event words
//! ┌────────────┐     ┌──────────┐     ┌──────────┐
//! │ head[prio] │ ──> │ port 12  │ ──> │ port 40  │ ──> NULL_PORT
//! └────────────┘     └──────────┘     └──────────┘
//!                                          ▲
//!                                     FifoQueue::tail
//! ```

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use axerrno::{AxResult, ax_err};
use spin::{Mutex, Once};

use crate::abi::{EVTCHN_FIFO_MAX_QUEUES, NULL_PORT, Port};

use super::control::ControlBlock;
use super::word::EventWord;

/// Tail of one priority queue.
#[derive(Debug)]
pub struct FifoQueue {
    tail: Port,
    priority: u8,
}

impl FifoQueue {
    pub const fn new(priority: u8) -> Self {
        Self {
            tail: NULL_PORT,
            priority,
        }
    }

    #[inline]
    pub fn tail(&self) -> Port {
        self.tail
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Appends `port` to the queue.
    ///
    /// The caller has already claimed LINKED on `word`. If the current tail is
    /// still linked it is pointed at `port`; otherwise the guest has drained
    /// it and `port` becomes the new head. Returns whether `port` became the
    /// head.
    pub fn push<'a, F>(
        &mut self,
        port: Port,
        word: &EventWord,
        word_of: F,
        control: &ControlBlock,
    ) -> bool
    where
        F: FnOnce(Port) -> Option<&'a EventWord>,
    {
        word.set_link(NULL_PORT);

        let linked = self.tail != NULL_PORT
            && self.tail != port
            && word_of(self.tail).is_some_and(|tail| tail.link_after(port));

        if !linked {
            control.set_head(self.priority, port);
        }
        self.tail = port;
        !linked
    }

    /// Forgets the tail if it is `port`.
    ///
    /// Called before `port` is linked anew: if it was the tail here, this
    /// queue has drained and must not append behind `port`, which may now be
    /// in another queue.
    #[inline]
    pub fn invalidate_tail(&mut self, port: Port) {
        if self.tail == port {
            self.tail = NULL_PORT;
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.tail = NULL_PORT;
    }
}

/// Queues and control block of one vCPU.
pub struct VcpuQueues {
    control: Once<ControlBlock>,
    queues: ArrayVec<Mutex<FifoQueue>, EVTCHN_FIFO_MAX_QUEUES>,
}

impl VcpuQueues {
    pub fn new() -> Self {
        Self {
            control: Once::new(),
            queues: (0..EVTCHN_FIFO_MAX_QUEUES)
                .map(|priority| Mutex::new(FifoQueue::new(priority as u8)))
                .collect(),
        }
    }

    /// The control block, once the guest has set it up.
    #[inline]
    pub fn control(&self) -> Option<&ControlBlock> {
        self.control.get()
    }

    /// Installs the control block. Returns it back if one is already set.
    pub fn set_control(&self, control: ControlBlock) -> Result<&ControlBlock, ControlBlock> {
        if self.control.is_completed() {
            return Err(control);
        }
        for queue in &self.queues {
            queue.lock().reset();
        }
        control.reset();
        Ok(self.control.call_once(|| control))
    }

    /// The queue for `priority`.
    ///
    /// Panics if `priority` is not below `EVTCHN_FIFO_MAX_QUEUES`.
    #[inline]
    pub fn queue(&self, priority: u8) -> &Mutex<FifoQueue> {
        &self.queues[priority as usize]
    }

    /// Walks the queue for `priority` from its head.
    ///
    /// Stops at `NULL_PORT` or at the first word the guest has already
    /// unlinked. More than `limit` entries can only mean a cycle and is
    /// reported as corruption.
    pub fn ports<'a, F>(&self, priority: u8, limit: usize, word_of: F) -> AxResult<Vec<Port>>
    where
        F: Fn(Port) -> Option<&'a EventWord>,
    {
        let Some(control) = self.control() else {
            return Ok(Vec::new());
        };

        // Hold the tail so no port is appended mid-walk.
        let _queue = self.queue(priority).lock();
        let mut ports = Vec::new();
        let mut port = control.head(priority).load(core::sync::atomic::Ordering::Acquire);
        while port != NULL_PORT {
            let Some(word) = word_of(port) else {
                return ax_err!(BadState, "queue links to a port without a word");
            };
            if !word.is_linked() {
                break;
            }
            if ports.len() >= limit {
                return ax_err!(BadState, "queue does not terminate");
            }
            ports.push(port);
            port = word.link();
        }
        Ok(ports)
    }
}

impl Default for VcpuQueues {
    fn default() -> Self {
        Self::new()
    }
}
