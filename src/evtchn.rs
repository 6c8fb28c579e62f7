//! Event channels of one domain.
//!
//! This module provides [`EventChannels`], which owns a domain's ports and
//! implements the hypercall-shaped operations on them.
//!
//! # Locking
//!
//! - **Administrative lock**: one `Mutex<AdminState>` per instance serialises
//!   everything that changes a channel's binding or adds storage
//!   (`init_control`, `expand_array`, `bind_*`, `alloc_unbound`, `close`, ...).
//! - **Channel lock**: each descriptor has its own short spin lock, taken by
//!   the signalling paths (`send`, `queue_virq`, `unmask`, peer `notify`) which
//!   never touch the administrative lock.
//! - **Queue lock**: each (vCPU, priority) queue guards its tail.
//! - **Event words**: lock-free atomics, shared with the guest.
//!
//! Locks are always taken in that order. Calls into another domain are made
//! with no local lock held.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use axerrno::{AxResult, ax_err, ax_err_type};
use memory_addr::PAGE_SIZE_4K;
use spin::{Mutex, RwLock};

use crate::abi::{
    DOMID_FIRST_RESERVED, DOMID_ROOTVM, DOMID_SELF, DomainId, EVTCHN_FIFO_LINK_BITS,
    EVTCHN_FIFO_PRIORITY_MIN, EvtchnAllocUnbound, EvtchnBindInterdomain, EvtchnBindIpi,
    EvtchnBindPirq, EvtchnBindVcpu, EvtchnBindVirq, EvtchnClose, EvtchnExpandArray,
    EvtchnInitControl, EvtchnSend, EvtchnSetPriority, EvtchnStatus, EvtchnUnmask, NR_VIRQS,
    NULL_PORT, Port, VcpuId,
};
use crate::channel::{Binding, Channel, ChannelInfo};
use crate::config::EvtchnConfig;
use crate::fifo::{ControlBlock, EventWord, EventWordFlags, VcpuQueues, check_offset};
use crate::hal::{EvtchnHal, PeerDomain};
use crate::pool::{GuestFrame, PortSpace, WORDS_PER_PAGE, gfn_to_gpa};

/// State only touched under the administrative lock.
struct AdminState {
    /// Where the next free-port scan starts.
    port_end: Port,
    /// Number of vCPUs with a control block.
    nr_control_blocks: usize,
    console_port: Option<Port>,
    store_port: Option<Port>,
}

impl AdminState {
    /// Drops any well-known role `port` had.
    fn forget(&mut self, port: Port) {
        if self.console_port == Some(port) {
            self.console_port = None;
        }
        if self.store_port == Some(port) {
            self.store_port = None;
        }
    }
}

/// FIFO event channels of one domain.
///
/// # Usage
///
/// ```rust,ignore
/// let evtchn = Arc::new(EventChannels::new(EvtchnConfig::new(domid, 2), hal)?);
///
/// // Guest setup path.
/// evtchn.init_control(&mut EvtchnInitControl { control_gfn, offset: 0, vcpu: 0, ..Default::default() })?;
/// evtchn.expand_array(&EvtchnExpandArray { array_gfn })?;
///
/// let mut virq = EvtchnBindVirq { virq: VIRQ_TIMER, vcpu: 0, port: 0 };
/// evtchn.bind_virq(&mut virq)?;
///
/// // Timer interrupt on the host side.
/// evtchn.queue_virq(VIRQ_TIMER)?;
/// ```
pub struct EventChannels<H: EvtchnHal> {
    config: EvtchnConfig,
    hal: H,
    ports: PortSpace,
    vcpus: Vec<VcpuQueues>,
    admin: Mutex<AdminState>,
    virq_to_port: [AtomicU32; NR_VIRQS],
    pirq_to_port: RwLock<BTreeMap<u32, Port>>,
    callback_via: AtomicU64,
}

impl<H: EvtchnHal> EventChannels<H> {
    /// Creates the event channels of a domain. No port is allocated and no
    /// guest memory is mapped until the guest asks for it.
    pub fn new(config: EvtchnConfig, hal: H) -> AxResult<Self> {
        config.validate()?;
        debug!(
            "dom{}: event channels for {} vCPUs, {} ports",
            config.domid, config.nr_vcpus, config.max_ports
        );

        Ok(Self {
            ports: PortSpace::new(config.max_ports),
            vcpus: (0..config.nr_vcpus).map(|_| VcpuQueues::new()).collect(),
            admin: Mutex::new(AdminState {
                port_end: 1,
                nr_control_blocks: 0,
                console_port: None,
                store_port: None,
            }),
            virq_to_port: core::array::from_fn(|_| AtomicU32::new(NULL_PORT)),
            pirq_to_port: RwLock::new(BTreeMap::new()),
            callback_via: AtomicU64::new(0),
            config,
            hal,
        })
    }

    /// Domain owning the ports.
    #[inline]
    pub fn domid(&self) -> DomainId {
        self.config.domid
    }

    #[inline]
    pub fn config(&self) -> &EvtchnConfig {
        &self.config
    }

    #[inline]
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Upcall mechanism last set by the guest.
    #[inline]
    pub fn callback_via(&self) -> u64 {
        self.callback_via.load(Ordering::Acquire)
    }

    /// Number of event word pages the guest has provided.
    pub fn word_pages(&self) -> usize {
        self.ports.word_pages()
    }

    /// Port allocated by [`bind_console`](Self::bind_console), if any.
    pub fn console_port(&self) -> Option<Port> {
        self.admin.lock().console_port
    }

    /// Port allocated by [`bind_store`](Self::bind_store), if any.
    pub fn store_port(&self) -> Option<Port> {
        self.admin.lock().store_port
    }

    fn vcpu(&self, vcpu: VcpuId) -> AxResult<&VcpuQueues> {
        self.vcpus
            .get(vcpu as usize)
            .ok_or_else(|| ax_err_type!(InvalidInput, "no such vCPU"))
    }

    fn channel(&self, port: Port) -> AxResult<&Channel> {
        self.ports
            .port_to_chan(port)
            .ok_or_else(|| ax_err_type!(NotFound, "invalid port"))
    }

    fn resolve_domid(&self, dom: DomainId) -> AxResult<DomainId> {
        match dom {
            DOMID_SELF => Ok(self.domid()),
            dom if dom >= DOMID_FIRST_RESERVED => ax_err!(InvalidInput, "reserved domain id"),
            dom => Ok(dom),
        }
    }

    fn map_frame(&self, gfn: u64) -> AxResult<GuestFrame> {
        let gpa = gfn_to_gpa(gfn)?;
        let hva = self.hal.map_guest_frame(gpa)?;
        if !memory_addr::is_aligned(hva.as_usize(), PAGE_SIZE_4K) {
            self.hal.unmap_guest_frame(gpa, hva);
            return ax_err!(BadAddress, "guest frame mapped unaligned");
        }
        // SAFETY: the HAL keeps the mapping valid until it is unmapped, which
        // only happens when the frame is handed back to it.
        Ok(unsafe { GuestFrame::new(gpa, hva) })
    }

    fn unmap_frame(&self, frame: GuestFrame) {
        self.hal.unmap_guest_frame(frame.gpa(), frame.hva());
    }

    // Ports

    /// Reserves `port` if it is free.
    fn try_reserve(&self, port: Port) -> AxResult<bool> {
        let chan = self.ports.make_chan_page(port)?;
        let mut info = chan.lock();
        if info.binding != Binding::Free {
            return Ok(false);
        }
        info.binding = Binding::Reserved;
        Ok(true)
    }

    /// Reserves the first free port at or after `port_end`, wrapping around.
    fn make_new_port(&self, admin: &mut AdminState) -> AxResult<Port> {
        let max_ports = self.ports.max_ports() as Port;
        let next = |port: Port| if port + 1 >= max_ports { 1 } else { port + 1 };

        let start = admin.port_end;
        let mut port = start;
        loop {
            if self.try_reserve(port)? {
                admin.port_end = next(port);
                return Ok(port);
            }
            port = next(port);
            if port == start {
                return ax_err!(NoMemory, "no free event channel port");
            }
        }
    }

    /// Reserves a specific port, so a later `bind_virq` or `bind_ipi` can
    /// name it.
    pub fn make_port(&self, port: Port) -> AxResult {
        if port == NULL_PORT {
            return ax_err!(NotFound, "port 0 is never bound");
        }
        let _admin = self.admin.lock();
        if !self.try_reserve(port)? {
            return ax_err!(BadState, "port in use");
        }
        trace!("dom{}: port {} reserved", self.domid(), port);
        Ok(())
    }

    /// Binds a fresh port.
    fn bind(&self, admin: &mut AdminState, binding: Binding, vcpu: VcpuId) -> AxResult<Port> {
        let port = self.make_new_port(admin)?;
        self.channel(port)?.lock().bind(binding, vcpu);
        Ok(port)
    }

    /// A port the guest picked itself for a new binding.
    fn claim_port(&self, port: Port) -> AxResult<&Channel> {
        if port == NULL_PORT {
            return ax_err!(NotFound, "port 0 is never bound");
        }
        let chan = self.ports.make_chan_page(port)?;
        match chan.lock().binding {
            Binding::Free | Binding::Reserved | Binding::Unbound { .. } => Ok(chan),
            _ => ax_err!(BadState, "port already bound"),
        }
    }

    // Pending and linking

    /// Marks a channel pending and queues it for its vCPU.
    ///
    /// Called with the channel locked. Without a word page the pending state
    /// is only recorded in the descriptor; `expand_array` replays it.
    fn set_pending(&self, port: Port, info: &mut ChannelInfo) {
        info.is_pending = true;
        let Some(word) = self.ports.port_to_word(port) else {
            trace!("dom{}: port {} pending without event word", self.domid(), port);
            return;
        };
        word.set_pending();
        self.link(port, info, word);
    }

    /// Links a pending word into the queue of its channel.
    fn link(&self, port: Port, info: &mut ChannelInfo, word: &EventWord) {
        if word.is_masked() || word.is_linked() {
            return;
        }
        let Some(vcpu) = self.vcpus.get(info.vcpuid as usize) else {
            return;
        };
        let Some(control) = vcpu.control() else {
            trace!("dom{}: vCPU {} has no control block yet", self.domid(), info.vcpuid);
            return;
        };

        // The queue the port was last in must not append behind it any more.
        let (last_vcpu, last_priority) = info.last_queue;
        if let Some(last) = self.vcpus.get(last_vcpu as usize) {
            last.queue(last_priority).lock().invalidate_tail(port);
        }

        if word.test_and_set_linked() {
            return;
        }
        info.last_queue = (info.vcpuid, info.priority);

        let head = vcpu.queue(info.priority).lock().push(
            port,
            word,
            |tail| self.ports.port_to_word(tail),
            control,
        );
        control.set_ready(info.priority);
        trace!(
            "dom{}: port {} linked on vCPU {} priority {}{}",
            self.domid(),
            port,
            info.vcpuid,
            info.priority,
            if head { " as head" } else { "" }
        );

        self.hal.raise_upcall(info.vcpuid, self.callback_via());
    }

    /// Re-runs `set_pending` for bound, pending channels in `ports` that
    /// `wanted` selects. Called under the administrative lock after new
    /// storage or a new control block appeared.
    fn replay_pending<P>(&self, ports: Range<Port>, wanted: P)
    where
        P: Fn(&ChannelInfo) -> bool,
    {
        for port in ports {
            // Channel pages are contiguous from port 0.
            let Some(chan) = self.ports.port_to_chan(port) else {
                break;
            };
            let mut info = chan.lock();
            if info.is_pending && info.binding.is_bound() && wanted(&*info) {
                self.set_pending(port, &mut info);
            }
        }
    }

    // Control block and storage

    /// `EVTCHNOP_init_control`: installs the control block of a vCPU.
    pub fn init_control(&self, arg: &mut EvtchnInitControl) -> AxResult {
        let vcpu = self.vcpu(arg.vcpu)?;
        check_offset(arg.offset as usize)?;

        let mut admin = self.admin.lock();
        if vcpu.control().is_some() {
            return ax_err!(BadState, "control block already set up");
        }

        let frame = self.map_frame(arg.control_gfn)?;
        let control = match ControlBlock::new(frame, arg.offset as usize) {
            Ok(control) => control,
            Err(frame) => {
                self.unmap_frame(frame);
                return ax_err!(InvalidInput, "control block does not fit in the page");
            }
        };
        if let Err(control) = vcpu.set_control(control) {
            self.unmap_frame(control.into_frame());
            return ax_err!(BadState, "control block already set up");
        }
        admin.nr_control_blocks += 1;
        arg.link_bits = EVTCHN_FIFO_LINK_BITS;

        debug!(
            "dom{}: vCPU {} control block at gfn {:#x} + {:#x}",
            self.domid(),
            arg.vcpu,
            arg.control_gfn,
            arg.offset
        );

        let target = arg.vcpu;
        self.replay_pending(1..self.ports.max_ports() as Port, |info| info.vcpuid == target);
        Ok(())
    }

    /// Records how upcalls are delivered to the guest.
    pub fn set_callback_via(&self, via: u64) {
        debug!("dom{}: callback via {:#x}", self.domid(), via);
        self.callback_via.store(via, Ordering::Release);
    }

    /// `EVTCHNOP_expand_array`: adds the next page of event words.
    pub fn expand_array(&self, arg: &EvtchnExpandArray) -> AxResult {
        let admin = self.admin.lock();
        if admin.nr_control_blocks == 0 {
            return ax_err!(BadState, "no control block set up");
        }
        if self.ports.word_pages_full() {
            return ax_err!(NoMemory, "event array already at its maximum size");
        }

        let frame = self.map_frame(arg.array_gfn)?;
        for word in frame.words() {
            word.reset();
        }
        let page = self.ports.add_word_page(frame)?;
        debug!(
            "dom{}: event word page {} at gfn {:#x}",
            self.domid(),
            page,
            arg.array_gfn
        );

        let first = (page * WORDS_PER_PAGE) as Port;
        let end = ((page + 1) * WORDS_PER_PAGE).min(self.ports.max_ports()) as Port;
        self.replay_pending(first..end, |_| true);
        drop(admin);
        Ok(())
    }

    // Binding

    /// `EVTCHNOP_alloc_unbound`: allocates a port another domain may connect to.
    pub fn alloc_unbound(&self, arg: &mut EvtchnAllocUnbound) -> AxResult {
        if arg.dom != DOMID_SELF && arg.dom != self.domid() {
            return ax_err!(InvalidInput, "cannot allocate ports of another domain");
        }
        let remote_dom = self.resolve_domid(arg.remote_dom)?;

        let mut admin = self.admin.lock();
        let port = self.bind(&mut admin, Binding::Unbound { remote_dom }, 0)?;
        arg.port = port;

        debug!("dom{}: port {} unbound for dom{}", self.domid(), port, remote_dom);
        Ok(())
    }

    /// `EVTCHNOP_bind_interdomain`: connects a new local port to an unbound
    /// port of `remote_dom`.
    pub fn bind_interdomain(&self, arg: &mut EvtchnBindInterdomain) -> AxResult {
        let remote_dom = self.resolve_domid(arg.remote_dom)?;
        let port = self.make_new_port(&mut self.admin.lock())?;

        // The local port stays reserved while the remote side is locked.
        let connected = if remote_dom == self.domid() {
            self.connect(arg.remote_port, remote_dom, port)
        } else {
            match self.hal.lookup_domain(remote_dom) {
                Some(peer) => peer.connect(arg.remote_port, self.domid(), port),
                None => ax_err!(NotFound, "no such domain"),
            }
        };

        let _admin = self.admin.lock();
        let chan = self.channel(port)?;
        let mut info = chan.lock();
        if let Err(err) = connected {
            info.release();
            return Err(err);
        }
        info.bind(
            Binding::Interdomain {
                remote_dom,
                remote_port: arg.remote_port,
            },
            0,
        );
        arg.local_port = port;
        debug!(
            "dom{}: port {} connected to dom{} port {}",
            self.domid(),
            port,
            remote_dom,
            arg.remote_port
        );

        // Anything sent to the remote port before it was connected is lost,
        // so conservatively signal once.
        self.set_pending(port, &mut info);
        Ok(())
    }

    /// `EVTCHNOP_bind_virq`: binds a virtual IRQ to a port on `arg.vcpu`.
    ///
    /// Binding an already bound virq again moves it to `arg.vcpu` and
    /// returns the same port.
    pub fn bind_virq(&self, arg: &mut EvtchnBindVirq) -> AxResult {
        let Some(slot) = self.virq_to_port.get(arg.virq as usize) else {
            return ax_err!(InvalidInput, "virq out of range");
        };
        self.vcpu(arg.vcpu)?;

        let mut admin = self.admin.lock();
        let bound = slot.load(Ordering::Acquire);
        let port = if bound != NULL_PORT {
            if arg.port != NULL_PORT && arg.port != bound {
                return ax_err!(BadState, "virq bound to another port");
            }
            self.channel(bound)?.lock().migrate(arg.vcpu);
            debug!(
                "dom{}: virq {} on port {} moved to vCPU {}",
                self.domid(),
                arg.virq,
                bound,
                arg.vcpu
            );
            bound
        } else {
            let binding = Binding::Virq { virq: arg.virq };
            let port = if arg.port != NULL_PORT {
                self.claim_port(arg.port)?.lock().bind(binding, arg.vcpu);
                admin.forget(arg.port);
                arg.port
            } else {
                self.bind(&mut admin, binding, arg.vcpu)?
            };
            slot.store(port, Ordering::Release);
            debug!(
                "dom{}: virq {} bound to port {} on vCPU {}",
                self.domid(),
                arg.virq,
                port,
                arg.vcpu
            );
            port
        };

        arg.port = port;
        Ok(())
    }

    /// `EVTCHNOP_bind_ipi`: binds a port for signalling `arg.vcpu` from
    /// within the domain.
    pub fn bind_ipi(&self, arg: &mut EvtchnBindIpi) -> AxResult {
        self.vcpu(arg.vcpu)?;

        let mut admin = self.admin.lock();
        let port = if arg.port != NULL_PORT {
            let chan = self.ports.make_chan_page(arg.port)?;
            let mut info = chan.lock();
            if info.binding == Binding::Ipi {
                info.migrate(arg.vcpu);
            } else {
                drop(info);
                self.claim_port(arg.port)?.lock().bind(Binding::Ipi, arg.vcpu);
                admin.forget(arg.port);
            }
            arg.port
        } else {
            self.bind(&mut admin, Binding::Ipi, arg.vcpu)?
        };

        arg.port = port;
        debug!("dom{}: ipi port {} on vCPU {}", self.domid(), port, arg.vcpu);
        Ok(())
    }

    /// `EVTCHNOP_bind_pirq`: binds a physical IRQ routed to the domain.
    pub fn bind_pirq(&self, arg: &mut EvtchnBindPirq) -> AxResult {
        if arg.pirq >= self.config.nr_pirqs {
            return ax_err!(InvalidInput, "pirq out of range");
        }

        let mut admin = self.admin.lock();
        if self.pirq_to_port.read().contains_key(&arg.pirq) {
            return ax_err!(AlreadyExists, "pirq already bound");
        }
        let port = self.bind(&mut admin, Binding::Pirq { pirq: arg.pirq }, 0)?;
        self.pirq_to_port.write().insert(arg.pirq, port);

        arg.port = port;
        debug!("dom{}: pirq {} bound to port {}", self.domid(), arg.pirq, port);
        Ok(())
    }

    /// `EVTCHNOP_bind_vcpu`: changes the vCPU a bound port notifies.
    ///
    /// A port still queued on the old vCPU stays there until the guest
    /// consumes it; its next event is queued on the new vCPU.
    pub fn bind_vcpu(&self, arg: &EvtchnBindVcpu) -> AxResult {
        self.vcpu(arg.vcpu)?;

        let _admin = self.admin.lock();
        let chan = self.channel(arg.port)?;
        let mut info = chan.lock();
        if !info.binding.is_bound() {
            return ax_err!(BadState, "port not bound");
        }
        info.migrate(arg.vcpu);

        debug!("dom{}: port {} moved to vCPU {}", self.domid(), arg.port, arg.vcpu);
        Ok(())
    }

    /// `EVTCHNOP_set_priority`: changes the queue priority of a bound port.
    pub fn set_priority(&self, arg: &EvtchnSetPriority) -> AxResult {
        if arg.priority > EVTCHN_FIFO_PRIORITY_MIN as u32 {
            return ax_err!(InvalidInput, "priority out of range");
        }

        let _admin = self.admin.lock();
        let chan = self.channel(arg.port)?;
        let mut info = chan.lock();
        if !info.binding.is_bound() {
            return ax_err!(BadState, "port not bound");
        }
        info.set_priority(arg.priority as u8);
        Ok(())
    }

    fn bind_well_known<F>(&self, role: F) -> AxResult<Port>
    where
        F: Fn(&mut AdminState) -> &mut Option<Port>,
    {
        let mut admin = self.admin.lock();
        if let Some(port) = *role(&mut *admin) {
            return Ok(port);
        }
        let port = self.bind(&mut admin, Binding::Unbound { remote_dom: DOMID_ROOTVM }, 0)?;
        *role(&mut *admin) = Some(port);
        Ok(port)
    }

    /// Port of the console ring, unbound for the root VM's backend.
    pub fn bind_console(&self) -> AxResult<Port> {
        let port = self.bind_well_known(|admin| &mut admin.console_port)?;
        debug!("dom{}: console port {}", self.domid(), port);
        Ok(port)
    }

    /// Port of the store ring, unbound for the root VM's backend.
    pub fn bind_store(&self) -> AxResult<Port> {
        let port = self.bind_well_known(|admin| &mut admin.store_port)?;
        debug!("dom{}: store port {}", self.domid(), port);
        Ok(port)
    }

    /// `EVTCHNOP_close`: returns a port to the free pool.
    ///
    /// The remote end of an interdomain channel reverts to unbound. A port
    /// still linked in a queue stays there until the guest consumes it.
    pub fn close(&self, arg: &EvtchnClose) -> AxResult {
        let binding = {
            let mut admin = self.admin.lock();
            let chan = self.channel(arg.port)?;
            let mut info = chan.lock();
            let binding = info.binding;
            match binding {
                Binding::Free | Binding::Reserved => return ax_err!(BadState, "port not bound"),
                Binding::Virq { virq } => {
                    if let Some(slot) = self.virq_to_port.get(virq as usize) {
                        // A mismatch means the virq already names another port.
                        slot.compare_exchange(
                            arg.port,
                            NULL_PORT,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .ok();
                    }
                }
                Binding::Pirq { pirq } => {
                    self.pirq_to_port.write().remove(&pirq);
                }
                _ => {}
            }

            if let Some(word) = self.ports.port_to_word(arg.port) {
                word.clear_pending();
            }
            info.release();
            admin.forget(arg.port);
            binding
        };
        debug!("dom{}: port {} closed ({:?})", self.domid(), arg.port, binding);

        if let Some((remote_dom, remote_port)) = binding.remote() {
            if remote_dom == self.domid() {
                self.disconnect(remote_port, remote_dom, arg.port);
            } else if let Some(peer) = self.hal.lookup_domain(remote_dom) {
                peer.disconnect(remote_port, self.domid(), arg.port);
            }
        }
        Ok(())
    }

    // Signalling

    /// `EVTCHNOP_send`: signals the other end of a port.
    pub fn send(&self, arg: &EvtchnSend) -> AxResult {
        let chan = self.channel(arg.port)?;
        let mut info = chan.lock();
        let binding = info.binding;
        match binding {
            Binding::Ipi => {
                self.set_pending(arg.port, &mut info);
                Ok(())
            }
            Binding::Interdomain {
                remote_dom,
                remote_port,
            } => {
                drop(info);
                if remote_dom == self.domid() {
                    return self.notify(remote_port);
                }
                match self.hal.lookup_domain(remote_dom) {
                    Some(peer) => peer.notify(remote_port),
                    None => ax_err!(NotFound, "remote domain gone"),
                }
            }
            Binding::Unbound { .. } => {
                trace!("dom{}: send on unbound port {} dropped", self.domid(), arg.port);
                Ok(())
            }
            Binding::Pirq { .. } | Binding::Virq { .. } => {
                ax_err!(BadState, "port is signalled by the hypervisor only")
            }
            Binding::Free | Binding::Reserved => ax_err!(BadState, "port not bound"),
        }
    }

    /// Raises a virtual IRQ.
    ///
    /// A virq with no bound port is dropped: nothing is remembered for a
    /// later bind.
    pub fn queue_virq(&self, virq: u32) -> AxResult {
        let Some(slot) = self.virq_to_port.get(virq as usize) else {
            return ax_err!(InvalidInput, "virq out of range");
        };
        let port = slot.load(Ordering::Acquire);
        if port == NULL_PORT {
            debug!("dom{}: virq {} not bound, dropped", self.domid(), virq);
            return Ok(());
        }

        let chan = self.channel(port)?;
        let mut info = chan.lock();
        if info.binding.virq() != Some(virq) {
            // Closed since the lookup.
            return Ok(());
        }
        self.set_pending(port, &mut info);
        Ok(())
    }

    /// Raises a physical IRQ routed to the domain; dropped if not bound.
    pub fn queue_pirq(&self, pirq: u32) -> AxResult {
        let Some(port) = self.pirq_to_port.read().get(&pirq).copied() else {
            debug!("dom{}: pirq {} not bound, dropped", self.domid(), pirq);
            return Ok(());
        };

        let chan = self.channel(port)?;
        let mut info = chan.lock();
        if info.binding.pirq() != Some(pirq) {
            return Ok(());
        }
        self.set_pending(port, &mut info);
        Ok(())
    }

    /// Masks a port's event word.
    pub fn mask(&self, port: Port) -> AxResult {
        match self.ports.port_to_word(port) {
            Some(word) => {
                word.set_masked();
                Ok(())
            }
            None => ax_err!(NotFound, "port has no event word"),
        }
    }

    /// `EVTCHNOP_unmask`: unmasks a port and delivers an event that became
    /// pending while it was masked.
    pub fn unmask(&self, arg: &EvtchnUnmask) -> AxResult {
        let chan = self.channel(arg.port)?;
        let Some(word) = self.ports.port_to_word(arg.port) else {
            return ax_err!(NotFound, "port has no event word");
        };

        let mut info = chan.lock();
        word.clear_masked();
        if word.is_pending() && info.binding.is_bound() {
            info.is_pending = true;
            self.link(arg.port, &mut info, word);
        }
        Ok(())
    }

    // Queries

    /// `EVTCHNOP_status`.
    pub fn status(&self, arg: &mut EvtchnStatus) -> AxResult {
        if arg.dom != DOMID_SELF && arg.dom != self.domid() {
            return ax_err!(InvalidInput, "cannot query ports of another domain");
        }
        let info = self.channel_info(arg.port)?;
        let (status, remote_dom, detail) = info.binding.status();
        arg.status = status;
        arg.vcpu = info.vcpuid;
        arg.remote_dom = remote_dom;
        arg.detail = detail;
        Ok(())
    }

    /// Copy of a port's channel descriptor, with the pending mirror
    /// refreshed from the event word.
    pub fn channel_info(&self, port: Port) -> AxResult<ChannelInfo> {
        let chan = self.channel(port)?;
        let mut info = chan.lock();
        self.sync_pending(port, &mut info);
        Ok(*info)
    }

    /// Picks up PENDING changes the guest made in the event word.
    fn sync_pending(&self, port: Port, info: &mut ChannelInfo) {
        if let Some(word) = self.ports.port_to_word(port) {
            info.is_pending = word.is_pending();
        }
    }

    /// Flag bits of a port's event word.
    pub fn word_flags(&self, port: Port) -> AxResult<EventWordFlags> {
        match self.ports.port_to_word(port) {
            Some(word) => Ok(word.flags()),
            None => ax_err!(NotFound, "port has no event word"),
        }
    }

    /// Whether a port is pending, refreshing the descriptor from the event
    /// word the guest may have acknowledged.
    pub fn is_pending(&self, port: Port) -> AxResult<bool> {
        Ok(self.channel_info(port)?.is_pending)
    }

    /// Head slot of a queue, as the guest sees it.
    pub fn queue_head(&self, vcpu: VcpuId, priority: u8) -> AxResult<Port> {
        if priority > EVTCHN_FIFO_PRIORITY_MIN {
            return ax_err!(InvalidInput, "priority out of range");
        }
        match self.vcpu(vcpu)?.control() {
            Some(control) => Ok(control.head(priority).load(Ordering::Acquire)),
            None => ax_err!(BadState, "no control block"),
        }
    }

    /// Ports queued on a vCPU at `priority`, head first.
    pub fn queue_ports(&self, vcpu: VcpuId, priority: u8) -> AxResult<Vec<Port>> {
        if priority > EVTCHN_FIFO_PRIORITY_MIN {
            return ax_err!(InvalidInput, "priority out of range");
        }
        self.vcpu(vcpu)?
            .ports(priority, self.ports.max_ports(), |port| self.ports.port_to_word(port))
    }
}

impl<H: EvtchnHal> PeerDomain for EventChannels<H> {
    fn domid(&self) -> DomainId {
        self.config.domid
    }

    fn connect(&self, port: Port, remote_dom: DomainId, remote_port: Port) -> AxResult {
        let _admin = self.admin.lock();
        let chan = self.channel(port)?;
        let mut info = chan.lock();
        let binding = info.binding;
        match binding {
            Binding::Unbound { remote_dom: allowed } if allowed == remote_dom => {
                info.binding = Binding::Interdomain {
                    remote_dom,
                    remote_port,
                };
                debug!(
                    "dom{}: port {} connected to dom{} port {}",
                    self.config.domid, port, remote_dom, remote_port
                );
                Ok(())
            }
            _ => ax_err!(BadState, "port is not waiting for this domain"),
        }
    }

    fn disconnect(&self, port: Port, remote_dom: DomainId, remote_port: Port) {
        let _admin = self.admin.lock();
        let Some(chan) = self.ports.port_to_chan(port) else {
            return;
        };
        let mut info = chan.lock();
        if info.binding
            == (Binding::Interdomain {
                remote_dom,
                remote_port,
            })
        {
            info.binding = Binding::Unbound { remote_dom };
            debug!(
                "dom{}: port {} unbound after dom{} closed",
                self.config.domid, port, remote_dom
            );
        }
    }

    fn notify(&self, port: Port) -> AxResult {
        let chan = self.channel(port)?;
        let mut info = chan.lock();
        if info.binding.remote().is_none() {
            return ax_err!(BadState, "port is not interdomain");
        }
        self.set_pending(port, &mut info);
        Ok(())
    }
}

impl<H: EvtchnHal> Drop for EventChannels<H> {
    fn drop(&mut self) {
        for frame in self.ports.word_frames() {
            self.hal.unmap_guest_frame(frame.gpa(), frame.hva());
        }
        for vcpu in &self.vcpus {
            if let Some(control) = vcpu.control() {
                let frame = control.frame();
                self.hal.unmap_guest_frame(frame.gpa(), frame.hva());
            }
        }
    }
}
