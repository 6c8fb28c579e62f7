//! Guest-visible ABI of the FIFO event-channel protocol.
//!
//! Everything in this module is fixed by the protocol being emulated: the
//! bit positions inside an event word, the control block layout, and the
//! argument structures the hypercall dispatcher hands to
//! [`EventChannels`](crate::EventChannels). None of it may change without
//! breaking guests.

/// Event channel port number.
pub type Port = u32;

/// Domain (partition) identifier.
pub type DomainId = u16;

/// Identifier of a virtual CPU inside the owning domain.
pub type VcpuId = u32;

/// Width of the link field of an event word.
pub const EVTCHN_FIFO_LINK_BITS: u32 = 17;

/// Number of ports addressable through the link field.
pub const EVTCHN_FIFO_NR_CHANNELS: usize = 1 << EVTCHN_FIFO_LINK_BITS;

/// Number of priority queues per vCPU.
pub const EVTCHN_FIFO_MAX_QUEUES: usize = 16;

/// Highest priority.
pub const EVTCHN_FIFO_PRIORITY_MAX: u8 = 0;

/// Priority assigned to newly bound channels.
pub const EVTCHN_FIFO_PRIORITY_DEFAULT: u8 = 7;

/// Lowest priority.
pub const EVTCHN_FIFO_PRIORITY_MIN: u8 = (EVTCHN_FIFO_MAX_QUEUES - 1) as u8;

/// Bit index of the PENDING flag in an event word.
pub const EVTCHN_FIFO_PENDING: u32 = 31;
/// Bit index of the MASKED flag in an event word.
pub const EVTCHN_FIFO_MASKED: u32 = 30;
/// Bit index of the LINKED flag in an event word.
pub const EVTCHN_FIFO_LINKED: u32 = 29;
/// Bit index of the BUSY flag in an event word.
pub const EVTCHN_FIFO_BUSY: u32 = 28;

/// Mask of the link field of an event word.
pub const EVTCHN_FIFO_LINK_MASK: u32 = (1 << EVTCHN_FIFO_LINK_BITS) - 1;

/// Queue terminator. Port 0 is never handed out.
pub const NULL_PORT: Port = 0;

/// Number of virtual IRQs a domain can bind.
pub const NR_VIRQS: usize = 24;

/// Timer tick.
pub const VIRQ_TIMER: u32 = 0;
/// Request a debug dump.
pub const VIRQ_DEBUG: u32 = 1;
/// Hypervisor console has data.
pub const VIRQ_CONSOLE: u32 = 2;
/// A domain has exited.
pub const VIRQ_DOM_EXC: u32 = 3;

/// First domain id reserved for special purposes.
pub const DOMID_FIRST_RESERVED: DomainId = 0x7FF0;

/// Refers to the calling domain.
pub const DOMID_SELF: DomainId = 0x7FF0;

/// Domain id of the root VM, which hosts the console and store backends.
pub const DOMID_ROOTVM: DomainId = DOMID_FIRST_RESERVED - 1;

/// Guest-visible per-vCPU control block.
///
/// The guest reads `head` to start draining a queue and `ready` to find out
/// which queues are non-empty. Every field is accessed atomically because the
/// guest owns the page and may write it at any time.
#[repr(C)]
pub struct EvtchnFifoControlBlock {
    pub ready: core::sync::atomic::AtomicU32,
    pub _rsvd: core::sync::atomic::AtomicU32,
    pub head: [core::sync::atomic::AtomicU32; EVTCHN_FIFO_MAX_QUEUES],
}

/// Size in bytes of [`EvtchnFifoControlBlock`].
pub const EVTCHN_FIFO_CONTROL_BLOCK_SIZE: usize = core::mem::size_of::<EvtchnFifoControlBlock>();

const _: () = assert!(EVTCHN_FIFO_CONTROL_BLOCK_SIZE == 8 + 4 * EVTCHN_FIFO_MAX_QUEUES);

/// `EVTCHNOP_init_control`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnInitControl {
    /// IN: guest frame number holding the control block.
    pub control_gfn: u64,
    /// IN: byte offset of the control block inside the frame.
    pub offset: u32,
    /// IN: vCPU the control block belongs to.
    pub vcpu: VcpuId,
    /// OUT: width of the link field.
    pub link_bits: u32,
    pub _pad: [u8; 4],
}

/// `EVTCHNOP_expand_array`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnExpandArray {
    /// IN: guest frame number of the next event word page.
    pub array_gfn: u64,
}

/// `EVTCHNOP_alloc_unbound`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnAllocUnbound {
    /// IN: domain to allocate in, `DOMID_SELF` for the caller.
    pub dom: DomainId,
    /// IN: domain allowed to bind to the new port.
    pub remote_dom: DomainId,
    /// OUT
    pub port: Port,
}

/// `EVTCHNOP_bind_interdomain`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnBindInterdomain {
    /// IN
    pub remote_dom: DomainId,
    /// IN: unbound port of `remote_dom` that names the caller.
    pub remote_port: Port,
    /// OUT
    pub local_port: Port,
}

/// `EVTCHNOP_bind_virq`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnBindVirq {
    /// IN
    pub virq: u32,
    /// IN
    pub vcpu: VcpuId,
    /// IN: pre-allocated port to bind, or 0. OUT: the bound port.
    pub port: Port,
}

/// `EVTCHNOP_bind_ipi`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnBindIpi {
    /// IN
    pub vcpu: VcpuId,
    /// IN: pre-allocated port to bind, or 0. OUT: the bound port.
    pub port: Port,
}

/// `EVTCHNOP_bind_pirq`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnBindPirq {
    /// IN
    pub pirq: u32,
    /// IN
    pub flags: u32,
    /// OUT
    pub port: Port,
}

/// `EVTCHNOP_bind_vcpu`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnBindVcpu {
    pub port: Port,
    pub vcpu: VcpuId,
}

/// `EVTCHNOP_send`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnSend {
    pub port: Port,
}

/// `EVTCHNOP_close`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnClose {
    pub port: Port,
}

/// `EVTCHNOP_unmask`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnUnmask {
    pub port: Port,
}

/// `EVTCHNOP_set_priority`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnSetPriority {
    pub port: Port,
    pub priority: u32,
}

/// `EVTCHNOP_status` channel states.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvtchnStatusKind {
    #[default]
    Closed = 0,
    Unbound = 1,
    Interdomain = 2,
    Pirq = 3,
    Virq = 4,
    Ipi = 5,
}

/// `EVTCHNOP_status`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EvtchnStatus {
    /// IN
    pub dom: DomainId,
    /// IN
    pub port: Port,
    /// OUT
    pub status: EvtchnStatusKind,
    /// OUT
    pub vcpu: VcpuId,
    /// OUT: remote domain for unbound/interdomain channels.
    pub remote_dom: DomainId,
    /// OUT: remote port for interdomain channels, pirq or virq number otherwise.
    pub detail: u32,
}
