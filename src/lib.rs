#![no_std]

//! # AxVM Event Channels
//!
//! This crate emulates the FIFO event-channel ABI for ArceOS virtual machines,
//! so paravirtualised guests can receive virtual interrupts, signal their own
//! vCPUs and talk to other domains.
//! It is designed for `no_std` environments and uses the `alloc` crate for dynamic memory allocation.
//!
//! ## Architecture
//!
//! ### Guest-shared state
//! - [`EventWord`]: One 32-bit word per port in guest memory (pending, masked, linked, busy, link)
//! - [`ControlBlock`]: Per-vCPU queue heads and ready bitmap in guest memory
//!
//! ### Hypervisor-private state
//! - [`Channel`] / [`ChannelInfo`]: Per-port descriptor and binding
//! - [`FifoQueue`] / [`VcpuQueues`]: Tails of the 16 priority queues of each vCPU
//!
//! ### High-Level API
//! - [`EventChannels`]: Port allocation, binding and signalling for one domain
//! - [`EvtchnConfig`]: Per-domain limits
//! - [`EvtchnHal`] / [`PeerDomain`]: What the core needs from the hypervisor and other domains
//!
//! ## Features
//!
//! - **Lock-free signalling**: Channel lookups never take the administrative lock
//! - **Lazy storage**: Descriptor pages are allocated when a port on them is first made,
//!   word pages arrive from the guest one at a time
//! - **Interdomain channels**: Ports connect across domains through [`PeerDomain`]
//!
//! ## Examples
//!
//! ### Guest setup and a timer virq
//!
//! ```rust,ignore
//! use axevtchn::abi::*;
//! use axevtchn::{EventChannels, EvtchnConfig};
//!
//! let evtchn = Arc::new(EventChannels::new(EvtchnConfig::new(domid, nr_vcpus), hal)?);
//!
//! // EVTCHNOP_init_control / EVTCHNOP_expand_array from the guest
//! evtchn.init_control(&mut EvtchnInitControl { control_gfn, vcpu: 0, ..Default::default() })?;
//! evtchn.expand_array(&EvtchnExpandArray { array_gfn })?;
//!
//! // EVTCHNOP_bind_virq
//! let mut bind = EvtchnBindVirq { virq: VIRQ_TIMER, vcpu: 0, port: 0 };
//! evtchn.bind_virq(&mut bind)?;
//!
//! // Host timer fired
//! evtchn.queue_virq(VIRQ_TIMER)?;
//! ```
//!
//! ### Connecting two domains
//!
//! ```rust,ignore
//! // Backend domain offers a port to the frontend
//! let mut offer = EvtchnAllocUnbound { dom: DOMID_SELF, remote_dom: frontend_id, port: 0 };
//! backend.alloc_unbound(&mut offer)?;
//!
//! // Frontend connects; the HAL resolves `backend_id` to `backend` as a `PeerDomain`
//! let mut bind = EvtchnBindInterdomain { remote_dom: backend_id, remote_port: offer.port, local_port: 0 };
//! frontend.bind_interdomain(&mut bind)?;
//!
//! frontend.send(&EvtchnSend { port: bind.local_port })?;
//! ```

extern crate alloc;
#[macro_use]
extern crate log;

pub mod abi;
mod channel;
mod config;
mod evtchn;
pub mod fifo;
mod hal;
mod pool;

pub use channel::{Binding, Channel, ChannelInfo, ChannelState};
pub use config::{DEFAULT_NR_PIRQS, EvtchnConfig};
pub use evtchn::EventChannels;
pub use fifo::{ControlBlock, EventWord, EventWordFlags, FifoQueue, VcpuQueues};
pub use hal::{EvtchnHal, PeerDomain};
pub use pool::{CHANS_PER_PAGE, GuestFrame, WORDS_PER_PAGE};
