//! Per-port channel descriptors.

use spin::{Mutex, MutexGuard};

use crate::abi::{DomainId, EVTCHN_FIFO_PRIORITY_DEFAULT, EvtchnStatusKind, Port, VcpuId};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Free,
    Reserved,
    Unbound,
    Interdomain,
    Pirq,
    Virq,
    Ipi,
}

/// What a channel is bound to.
///
/// The variant is the channel's state; kind-specific data only exists in the
/// variant it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Available for allocation.
    Free,
    /// Taken by a bind that has not finished yet.
    Reserved,
    /// Allocated, waiting for `remote_dom` to connect.
    Unbound { remote_dom: DomainId },
    /// Connected to `remote_port` of `remote_dom`.
    Interdomain {
        remote_dom: DomainId,
        remote_port: Port,
    },
    /// Physical IRQ passthrough.
    Pirq { pirq: u32 },
    /// Virtual IRQ raised by the hypervisor.
    Virq { virq: u32 },
    /// Inter-processor interrupt within the domain.
    Ipi,
}

impl Binding {
    pub fn state(&self) -> ChannelState {
        match self {
            Self::Free => ChannelState::Free,
            Self::Reserved => ChannelState::Reserved,
            Self::Unbound { .. } => ChannelState::Unbound,
            Self::Interdomain { .. } => ChannelState::Interdomain,
            Self::Pirq { .. } => ChannelState::Pirq,
            Self::Virq { .. } => ChannelState::Virq,
            Self::Ipi => ChannelState::Ipi,
        }
    }

    /// Bound to something, i.e. neither free nor mid-allocation.
    pub fn is_bound(&self) -> bool {
        !matches!(self, Self::Free | Self::Reserved)
    }

    /// The virq number, only for virq channels.
    pub fn virq(&self) -> Option<u32> {
        match *self {
            Self::Virq { virq } => Some(virq),
            _ => None,
        }
    }

    /// The pirq number, only for pirq channels.
    pub fn pirq(&self) -> Option<u32> {
        match *self {
            Self::Pirq { pirq } => Some(pirq),
            _ => None,
        }
    }

    /// The remote end, only for interdomain channels.
    pub fn remote(&self) -> Option<(DomainId, Port)> {
        match *self {
            Self::Interdomain {
                remote_dom,
                remote_port,
            } => Some((remote_dom, remote_port)),
            _ => None,
        }
    }

    /// `EVTCHNOP_status` view of the binding: kind, remote domain, detail.
    pub fn status(&self) -> (EvtchnStatusKind, DomainId, u32) {
        match *self {
            Self::Free | Self::Reserved => (EvtchnStatusKind::Closed, 0, 0),
            Self::Unbound { remote_dom } => (EvtchnStatusKind::Unbound, remote_dom, 0),
            Self::Interdomain {
                remote_dom,
                remote_port,
            } => (EvtchnStatusKind::Interdomain, remote_dom, remote_port),
            Self::Pirq { pirq } => (EvtchnStatusKind::Pirq, 0, pirq),
            Self::Virq { virq } => (EvtchnStatusKind::Virq, 0, virq),
            Self::Ipi => (EvtchnStatusKind::Ipi, 0, 0),
        }
    }
}

/// Mutable part of a channel descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub binding: Binding,
    /// Mirrors the PENDING bit of the port's event word.
    pub is_pending: bool,
    pub priority: u8,
    /// Priority before the last `set_priority`.
    pub prev_priority: u8,
    pub vcpuid: VcpuId,
    /// vCPU the port notified before its last migration.
    pub prev_vcpuid: VcpuId,
    /// Queue (vCPU, priority) the port was last linked into.
    pub last_queue: (VcpuId, u8),
}

impl ChannelInfo {
    pub const fn free() -> Self {
        Self {
            binding: Binding::Free,
            is_pending: false,
            priority: EVTCHN_FIFO_PRIORITY_DEFAULT,
            prev_priority: EVTCHN_FIFO_PRIORITY_DEFAULT,
            vcpuid: 0,
            prev_vcpuid: 0,
            last_queue: (0, EVTCHN_FIFO_PRIORITY_DEFAULT),
        }
    }

    /// Gives the channel a new binding on `vcpu` at the default priority.
    ///
    /// `last_queue` is kept: the port may still sit in the queue it was last
    /// linked into.
    pub fn bind(&mut self, binding: Binding, vcpu: VcpuId) {
        self.binding = binding;
        self.vcpuid = vcpu;
        self.prev_vcpuid = vcpu;
        self.priority = EVTCHN_FIFO_PRIORITY_DEFAULT;
        self.prev_priority = EVTCHN_FIFO_PRIORITY_DEFAULT;
    }

    /// Points the channel at another vCPU, remembering the old one.
    pub fn migrate(&mut self, vcpu: VcpuId) {
        self.prev_vcpuid = self.vcpuid;
        self.vcpuid = vcpu;
    }

    /// Moves the channel to another priority, remembering the old one.
    pub fn set_priority(&mut self, priority: u8) {
        self.prev_priority = self.priority;
        self.priority = priority;
    }

    /// Returns the channel to the free state, keeping `last_queue`.
    pub fn release(&mut self) {
        let last_queue = self.last_queue;
        *self = Self::free();
        self.last_queue = last_queue;
    }
}

/// Channel descriptor for one port.
///
/// Descriptors live in host pages, so their size is a power of two that
/// divides the page size.
#[repr(align(64))]
pub struct Channel {
    port: Port,
    info: Mutex<ChannelInfo>,
}

impl Channel {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            info: Mutex::new(ChannelInfo::free()),
        }
    }

    #[inline]
    pub fn port(&self) -> Port {
        self.port
    }

    /// Locks the descriptor for an update.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ChannelInfo> {
        self.info.lock()
    }

    /// Copy of the descriptor's current contents.
    #[inline]
    pub fn snapshot(&self) -> ChannelInfo {
        *self.info.lock()
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.info.lock().binding.state()
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("port", &self.port)
            .field("info", &self.snapshot())
            .finish()
    }
}
