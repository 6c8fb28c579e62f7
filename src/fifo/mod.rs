//! The FIFO event delivery layer shared with the guest.
//!
//! # Architecture
//!
//! ```text
//!   send / queue_virq
//!          │
//!          ▼
//!  ┌────────────────┐  PENDING, LINKED   ┌─────────────────────┐
//!  │  EventWord     │ ─────────────────> │ FifoQueue (vCPU, p) │
//!  │  (guest page)  │ <───── link ────── │  tail               │
//!  └────────────────┘                    └──────────┬──────────┘
//!                                                   │ head[p], ready
//!                                                   ▼
//!                                        ┌─────────────────────┐
//!                                        │ ControlBlock (vCPU) │ ──> guest drains
//!                                        └─────────────────────┘
//! ```
//!
//! - [`EventWord`]: lock-free flag bits and link field, one per port.
//! - [`FifoQueue`]: tail of one priority queue, guarded by a short spin lock.
//! - [`ControlBlock`]: the guest page exposing queue heads.

mod control;
mod queue;
mod word;

pub use control::{ControlBlock, check_offset};
pub use queue::{FifoQueue, VcpuQueues};
pub use word::{EventWord, EventWordFlags};
