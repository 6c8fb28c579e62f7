//! Interfaces the event-channel core consumes from the rest of the hypervisor.

use alloc::sync::Arc;

use axaddrspace::{GuestPhysAddr, HostVirtAddr};
use axerrno::AxResult;

use crate::abi::{DomainId, Port, VcpuId};

/// Services the surrounding hypervisor provides to an event-channel instance.
///
/// The core never owns vCPUs, domains or guest memory; it reaches them only
/// through this trait, by identifier.
pub trait EvtchnHal: Send + Sync {
    /// Maps one 4 KiB guest frame into host-virtual memory.
    ///
    /// The returned address must be page aligned and stay valid until
    /// [`unmap_guest_frame`](Self::unmap_guest_frame) is called for it.
    fn map_guest_frame(&self, gpa: GuestPhysAddr) -> AxResult<HostVirtAddr>;

    /// Releases a mapping obtained from [`map_guest_frame`](Self::map_guest_frame).
    fn unmap_guest_frame(&self, gpa: GuestPhysAddr, hva: HostVirtAddr);

    /// Requests that `vcpu` be interrupted so it drains its event queues.
    ///
    /// `via` is the delivery mechanism last recorded by
    /// [`set_callback_via`](crate::EventChannels::set_callback_via).
    fn raise_upcall(&self, vcpu: VcpuId, via: u64);

    /// Looks up the event channels of another domain.
    fn lookup_domain(&self, domid: DomainId) -> Option<Arc<dyn PeerDomain>>;
}

/// The side of an event-channel instance other domains talk to.
pub trait PeerDomain: Send + Sync {
    /// Domain owning this instance.
    fn domid(&self) -> DomainId;

    /// Connects `port`, which must be unbound and reserved for `remote_dom`,
    /// to `remote_port` of `remote_dom`.
    fn connect(&self, port: Port, remote_dom: DomainId, remote_port: Port) -> AxResult;

    /// Reverts an interdomain `port` to unbound after the remote end closed.
    fn disconnect(&self, port: Port, remote_dom: DomainId, remote_port: Port);

    /// Marks `port` pending on behalf of its remote end.
    fn notify(&self, port: Port) -> AxResult;
}

impl<T: EvtchnHal + ?Sized> EvtchnHal for Arc<T> {
    fn map_guest_frame(&self, gpa: GuestPhysAddr) -> AxResult<HostVirtAddr> {
        (**self).map_guest_frame(gpa)
    }

    fn unmap_guest_frame(&self, gpa: GuestPhysAddr, hva: HostVirtAddr) {
        (**self).unmap_guest_frame(gpa, hva)
    }

    fn raise_upcall(&self, vcpu: VcpuId, via: u64) {
        (**self).raise_upcall(vcpu, via)
    }

    fn lookup_domain(&self, domid: DomainId) -> Option<Arc<dyn PeerDomain>> {
        (**self).lookup_domain(domid)
    }
}
