use axaddrspace::{GuestPhysAddr, HostVirtAddr};
use axerrno::{AxError, AxResult};
use axevtchn::abi::*;
use axevtchn::{
    Binding, ChannelState, EventChannels, EventWord, EventWordFlags, EvtchnConfig, EvtchnHal,
    PeerDomain,
};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

const PAGE_SIZE: usize = 0x1000;
const CONTROL_GFN: u64 = 0x100;
const ARRAY_GFN: u64 = 0x200;

type Domain = EventChannels<Arc<MockHal>>;

/// Routes lookups between the domains of a test.
#[derive(Default)]
struct Machine {
    domains: Mutex<HashMap<DomainId, Weak<Domain>>>,
}

impl Machine {
    fn create_domain(self: &Arc<Self>, config: EvtchnConfig) -> (Arc<MockHal>, Arc<Domain>) {
        let hal = Arc::new(MockHal::new(self.clone()));
        let domid = config.domid;
        let domain = Arc::new(EventChannels::new(config, hal.clone()).expect("bad config"));
        self.domains
            .lock()
            .unwrap()
            .insert(domid, Arc::downgrade(&domain));
        (hal, domain)
    }
}

/// Guest memory of one domain plus everything the core asked the
/// hypervisor to do.
struct MockHal {
    machine: Arc<Machine>,
    pages: Mutex<HashMap<usize, usize>>,
    upcalls: Mutex<Vec<VcpuId>>,
    unmapped: Mutex<Vec<usize>>,
}

impl MockHal {
    fn new(machine: Arc<Machine>) -> Self {
        Self {
            machine,
            pages: Mutex::new(HashMap::new()),
            upcalls: Mutex::new(Vec::new()),
            unmapped: Mutex::new(Vec::new()),
        }
    }

    fn layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    fn page(&self, gfn: u64) -> usize {
        *self
            .pages
            .lock()
            .unwrap()
            .get(&(gfn as usize * PAGE_SIZE))
            .expect("guest frame never mapped")
    }

    /// The event word of `port`, as the guest sees it.
    fn word(&self, port: Port) -> &EventWord {
        let page = self.page(ARRAY_GFN + (port as u64 / 1024));
        unsafe { &*((page + (port as usize % 1024) * 4) as *const EventWord) }
    }

    /// The control block of `vcpu`, as the guest sees it.
    fn control(&self, vcpu: VcpuId) -> &EvtchnFifoControlBlock {
        let page = self.page(CONTROL_GFN + vcpu as u64);
        unsafe { &*(page as *const EvtchnFifoControlBlock) }
    }

    /// Takes the first port off a queue, like a guest upcall handler.
    fn pop(&self, vcpu: VcpuId, priority: u8) -> Option<Port> {
        let head = &self.control(vcpu).head[priority as usize];
        let port = head.load(Ordering::Acquire);
        if port == NULL_PORT {
            return None;
        }
        let word = self.word(port);
        head.store(word.unlink(), Ordering::Release);
        word.clear_pending();
        Some(port)
    }

    fn upcalls(&self) -> Vec<VcpuId> {
        self.upcalls.lock().unwrap().clone()
    }
}

impl Drop for MockHal {
    fn drop(&mut self) {
        for (_, hva) in self.pages.lock().unwrap().drain() {
            unsafe { dealloc(hva as *mut u8, Self::layout()) }
        }
    }
}

impl EvtchnHal for MockHal {
    fn map_guest_frame(&self, gpa: GuestPhysAddr) -> AxResult<HostVirtAddr> {
        let mut pages = self.pages.lock().unwrap();
        let hva = *pages
            .entry(gpa.as_usize())
            .or_insert_with(|| unsafe { alloc_zeroed(Self::layout()) } as usize);
        Ok(HostVirtAddr::from(hva))
    }

    fn unmap_guest_frame(&self, gpa: GuestPhysAddr, _hva: HostVirtAddr) {
        self.unmapped.lock().unwrap().push(gpa.as_usize());
    }

    fn raise_upcall(&self, vcpu: VcpuId, _via: u64) {
        self.upcalls.lock().unwrap().push(vcpu);
    }

    fn lookup_domain(&self, domid: DomainId) -> Option<Arc<dyn PeerDomain>> {
        let domains = self.machine.domains.lock().unwrap();
        let domain = domains.get(&domid)?.upgrade()?;
        Some(domain as Arc<dyn PeerDomain>)
    }
}

/// A domain with control blocks on every vCPU and one word page.
fn boot(machine: &Arc<Machine>, domid: DomainId, nr_vcpus: usize) -> (Arc<MockHal>, Arc<Domain>) {
    let (hal, domain) = machine.create_domain(EvtchnConfig::new(domid, nr_vcpus));
    for vcpu in 0..nr_vcpus as VcpuId {
        let mut init = EvtchnInitControl {
            control_gfn: CONTROL_GFN + vcpu as u64,
            vcpu,
            ..Default::default()
        };
        domain.init_control(&mut init).expect("init_control failed");
    }
    domain
        .expand_array(&EvtchnExpandArray { array_gfn: ARRAY_GFN })
        .expect("expand_array failed");
    (hal, domain)
}

fn bind_ipi(domain: &Domain, vcpu: VcpuId) -> Port {
    let mut arg = EvtchnBindIpi { vcpu, port: 0 };
    domain.bind_ipi(&mut arg).expect("bind_ipi failed");
    arg.port
}

#[test]
fn test_virq_reaches_guest() {
    let machine = Arc::new(Machine::default());
    let (hal, domain) = boot(&machine, 1, 1);

    let mut bind = EvtchnBindVirq { virq: 5, vcpu: 0, port: 0 };
    domain.bind_virq(&mut bind).unwrap();
    assert_eq!(bind.port, 1);

    domain.queue_virq(5).unwrap();

    let flags = hal.word(1).flags();
    assert!(flags.contains(EventWordFlags::PENDING | EventWordFlags::LINKED));
    assert_eq!(hal.control(0).head[7].load(Ordering::Acquire), 1);
    assert_eq!(hal.control(0).ready.load(Ordering::Acquire) & (1 << 7), 1 << 7);
    assert_eq!(hal.upcalls(), [0]);

    assert_eq!(hal.pop(0, 7), Some(1));
    assert_eq!(hal.pop(0, 7), None);
    assert!(!domain.is_pending(1).unwrap());

    // Delivered again once consumed.
    domain.queue_virq(5).unwrap();
    assert_eq!(hal.pop(0, 7), Some(1));
    assert_eq!(hal.upcalls(), [0, 0]);
}

#[test]
fn test_virq_on_unbound_port() {
    let machine = Arc::new(Machine::default());
    let (hal, domain) = boot(&machine, 1, 1);

    let mut unbound = EvtchnAllocUnbound {
        dom: DOMID_SELF,
        remote_dom: 0,
        port: 0,
    };
    domain.alloc_unbound(&mut unbound).unwrap();
    let port = unbound.port;

    let mut bind = EvtchnBindVirq { virq: 5, vcpu: 0, port };
    domain.bind_virq(&mut bind).unwrap();
    assert_eq!(bind.port, port);

    domain.queue_virq(5).unwrap();

    let info = domain.channel_info(port).unwrap();
    assert_eq!(info.binding.state(), ChannelState::Virq);
    assert!(info.is_pending);
    assert_eq!(domain.queue_ports(0, EVTCHN_FIFO_PRIORITY_DEFAULT).unwrap(), [port]);
    assert_eq!(domain.queue_head(0, EVTCHN_FIFO_PRIORITY_DEFAULT).unwrap(), port);
    assert_eq!(hal.upcalls(), [0]);
}

#[test]
fn test_concurrent_sends_keep_queue_intact() {
    let machine = Arc::new(Machine::default());
    let (hal, domain) = boot(&machine, 1, 1);
    let ports: Vec<Port> = (0..64).map(|_| bind_ipi(&domain, 0)).collect();

    let handles: Vec<_> = ports
        .chunks(16)
        .map(|chunk| {
            let domain = domain.clone();
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for port in chunk {
                    domain.send(&EvtchnSend { port }).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let queued = domain.queue_ports(0, EVTCHN_FIFO_PRIORITY_DEFAULT).unwrap();
    assert_eq!(queued.len(), ports.len());
    assert_eq!(
        queued.iter().copied().collect::<BTreeSet<_>>(),
        ports.iter().copied().collect::<BTreeSet<_>>()
    );
    assert_eq!(hal.upcalls().len(), ports.len());

    let mut drained = Vec::new();
    while let Some(port) = hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT) {
        drained.push(port);
    }
    assert_eq!(drained, queued);
}

#[test]
fn test_concurrent_allocation_is_unique() {
    let machine = Arc::new(Machine::default());
    let (_hal, domain) = machine.create_domain(EvtchnConfig::new(1, 1));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let domain = domain.clone();
            thread::spawn(move || {
                (0..200)
                    .map(|_| {
                        let mut arg = EvtchnAllocUnbound {
                            dom: DOMID_SELF,
                            remote_dom: 0,
                            port: 0,
                        };
                        domain.alloc_unbound(&mut arg).unwrap();
                        arg.port
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for port in handle.join().unwrap() {
            assert_ne!(port, NULL_PORT);
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }
    assert_eq!(seen.len(), 800);
}

#[test]
fn test_interdomain_channel() {
    let machine = Arc::new(Machine::default());
    let (back_hal, backend) = boot(&machine, 1, 1);
    let (front_hal, frontend) = boot(&machine, 2, 1);

    let mut offer = EvtchnAllocUnbound {
        dom: DOMID_SELF,
        remote_dom: 2,
        port: 0,
    };
    backend.alloc_unbound(&mut offer).unwrap();

    let mut bind = EvtchnBindInterdomain {
        remote_dom: 1,
        remote_port: offer.port,
        local_port: 0,
    };
    frontend.bind_interdomain(&mut bind).unwrap();
    assert_eq!(
        backend.channel_info(offer.port).unwrap().binding,
        Binding::Interdomain {
            remote_dom: 2,
            remote_port: bind.local_port
        }
    );
    // The new local port starts out pending.
    assert_eq!(front_hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(bind.local_port));

    frontend.send(&EvtchnSend { port: bind.local_port }).unwrap();
    assert_eq!(back_hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(offer.port));

    backend.send(&EvtchnSend { port: offer.port }).unwrap();
    assert_eq!(front_hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(bind.local_port));

    frontend.close(&EvtchnClose { port: bind.local_port }).unwrap();
    assert_eq!(
        backend.channel_info(offer.port).unwrap().binding,
        Binding::Unbound { remote_dom: 2 }
    );
    // Nobody listens any more; the event is dropped.
    assert_eq!(backend.send(&EvtchnSend { port: offer.port }), Ok(()));
    assert_eq!(front_hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), None);
}

#[test]
fn test_interdomain_rejections() {
    let machine = Arc::new(Machine::default());
    let (_hal1, dom1) = boot(&machine, 1, 1);
    let (_hal2, dom2) = boot(&machine, 2, 1);
    let (_hal3, dom3) = boot(&machine, 3, 1);

    let mut offer = EvtchnAllocUnbound {
        dom: DOMID_SELF,
        remote_dom: 2,
        port: 0,
    };
    dom1.alloc_unbound(&mut offer).unwrap();

    // Offered to dom2 only.
    let mut bind = EvtchnBindInterdomain {
        remote_dom: 1,
        remote_port: offer.port,
        local_port: 0,
    };
    assert_eq!(dom3.bind_interdomain(&mut bind), Err(AxError::BadState));
    assert_eq!(dom3.channel_info(1).unwrap().binding.state(), ChannelState::Free);

    bind.remote_dom = 9;
    assert_eq!(dom2.bind_interdomain(&mut bind), Err(AxError::NotFound));

    bind.remote_dom = DOMID_FIRST_RESERVED + 1;
    assert_eq!(dom2.bind_interdomain(&mut bind), Err(AxError::InvalidInput));

    bind.remote_dom = 1;
    dom2.bind_interdomain(&mut bind).unwrap();
    assert_eq!(dom3.bind_interdomain(&mut bind), Err(AxError::BadState));
}

#[test]
fn test_expand_array_limit() {
    let machine = Arc::new(Machine::default());
    let config = EvtchnConfig::new(1, 1).with_max_ports(2048);
    let (_hal, domain) = machine.create_domain(config);

    let mut init = EvtchnInitControl {
        control_gfn: CONTROL_GFN,
        ..Default::default()
    };
    domain.init_control(&mut init).unwrap();

    for gfn in [ARRAY_GFN, ARRAY_GFN + 1] {
        domain.expand_array(&EvtchnExpandArray { array_gfn: gfn }).unwrap();
    }
    assert_eq!(domain.word_pages(), 2);
    assert_eq!(
        domain.expand_array(&EvtchnExpandArray { array_gfn: ARRAY_GFN + 2 }),
        Err(AxError::NoMemory)
    );
}

#[test]
fn test_bind_ipi_rejects_unknown_vcpu() {
    let machine = Arc::new(Machine::default());
    let (_hal, domain) = boot(&machine, 1, 2);

    let mut arg = EvtchnBindIpi { vcpu: 2, port: 0 };
    assert_eq!(domain.bind_ipi(&mut arg), Err(AxError::InvalidInput));

    // Explicit ports are left exactly as they were.
    domain.make_port(40).unwrap();
    let mut arg = EvtchnBindIpi { vcpu: 2, port: 40 };
    assert_eq!(domain.bind_ipi(&mut arg), Err(AxError::InvalidInput));
    assert_eq!(arg.port, 40);
    assert_eq!(domain.channel_info(40).unwrap().binding, Binding::Reserved);

    let mut arg = EvtchnBindIpi { vcpu: 2, port: 41 };
    assert_eq!(domain.bind_ipi(&mut arg), Err(AxError::InvalidInput));
    assert_eq!(domain.channel_info(41).unwrap().binding.state(), ChannelState::Free);

    let port = bind_ipi(&domain, 1);
    domain.send(&EvtchnSend { port }).unwrap();
    assert_eq!(domain.queue_ports(1, EVTCHN_FIFO_PRIORITY_DEFAULT).unwrap(), [port]);
    assert!(domain.queue_ports(0, EVTCHN_FIFO_PRIORITY_DEFAULT).unwrap().is_empty());
}

#[test]
fn test_priorities_are_separate_queues() {
    let machine = Arc::new(Machine::default());
    let (hal, domain) = boot(&machine, 1, 1);
    let urgent = bind_ipi(&domain, 0);
    let normal = bind_ipi(&domain, 0);
    domain
        .set_priority(&EvtchnSetPriority {
            port: urgent,
            priority: EVTCHN_FIFO_PRIORITY_MAX as u32,
        })
        .unwrap();

    domain.send(&EvtchnSend { port: normal }).unwrap();
    domain.send(&EvtchnSend { port: urgent }).unwrap();

    let ready = hal.control(0).ready.load(Ordering::Acquire);
    assert_eq!(ready, (1 << EVTCHN_FIFO_PRIORITY_MAX) | (1 << EVTCHN_FIFO_PRIORITY_DEFAULT));
    assert_eq!(hal.pop(0, EVTCHN_FIFO_PRIORITY_MAX), Some(urgent));
    assert_eq!(hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(normal));
}

#[test]
fn test_masked_event_redelivered_on_unmask() {
    let machine = Arc::new(Machine::default());
    let (hal, domain) = boot(&machine, 1, 1);
    let port = bind_ipi(&domain, 0);

    // The guest masks directly in its word.
    hal.word(port).set_masked();
    domain.send(&EvtchnSend { port }).unwrap();
    assert_eq!(hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), None);
    assert!(domain.is_pending(port).unwrap());

    domain.unmask(&EvtchnUnmask { port }).unwrap();
    assert_eq!(hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(port));
    assert_eq!(hal.upcalls(), [0]);
}

#[test]
fn test_status_reports_binding() {
    let machine = Arc::new(Machine::default());
    let (_hal, domain) = boot(&machine, 1, 2);

    let mut virq = EvtchnBindVirq {
        virq: VIRQ_DEBUG,
        vcpu: 1,
        port: 0,
    };
    domain.bind_virq(&mut virq).unwrap();

    let mut status = EvtchnStatus {
        dom: DOMID_SELF,
        port: virq.port,
        ..Default::default()
    };
    domain.status(&mut status).unwrap();
    assert_eq!(status.status, EvtchnStatusKind::Virq);
    assert_eq!((status.vcpu, status.detail), (1, VIRQ_DEBUG));

    status.port = virq.port + 1;
    domain.status(&mut status).unwrap();
    assert_eq!(status.status, EvtchnStatusKind::Closed);
}

#[test]
fn test_drop_unmaps_guest_frames() {
    let machine = Arc::new(Machine::default());
    let (hal, domain) = boot(&machine, 1, 2);
    drop(domain);

    let mut unmapped = hal.unmapped.lock().unwrap().clone();
    unmapped.sort();
    let expected = [CONTROL_GFN, CONTROL_GFN + 1, ARRAY_GFN]
        .map(|gfn| gfn as usize * PAGE_SIZE)
        .to_vec();
    assert_eq!(unmapped, expected);
}

/// Checks that every port's descriptor agrees with its event word.
fn assert_pending_mirror(domain: &Domain, ports: &[Port]) {
    for &port in ports {
        let info = domain.channel_info(port).unwrap();
        let flags = domain.word_flags(port).unwrap();
        assert_eq!(
            info.is_pending,
            flags.contains(EventWordFlags::PENDING),
            "port {port} descriptor and word disagree"
        );
    }
}

#[test]
fn test_pending_mirror_matches_word() {
    let machine = Arc::new(Machine::default());
    let (hal, domain) = boot(&machine, 1, 2);

    let mut virq = EvtchnBindVirq {
        virq: VIRQ_TIMER,
        vcpu: 1,
        port: 0,
    };
    domain.bind_virq(&mut virq).unwrap();
    let a = bind_ipi(&domain, 0);
    let b = bind_ipi(&domain, 0);
    let c = bind_ipi(&domain, 1);
    let ports = [virq.port, a, b, c];
    assert_pending_mirror(&domain, &ports);

    domain.send(&EvtchnSend { port: a }).unwrap();
    domain.send(&EvtchnSend { port: b }).unwrap();
    domain.queue_virq(VIRQ_TIMER).unwrap();
    assert_pending_mirror(&domain, &ports);

    assert_eq!(hal.pop(0, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(a));
    assert_pending_mirror(&domain, &ports);

    domain.mask(c).unwrap();
    domain.send(&EvtchnSend { port: c }).unwrap();
    assert_pending_mirror(&domain, &ports);

    domain.close(&EvtchnClose { port: b }).unwrap();
    assert_pending_mirror(&domain, &ports);

    domain.unmask(&EvtchnUnmask { port: c }).unwrap();
    assert_eq!(hal.pop(1, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(virq.port));
    assert_eq!(hal.pop(1, EVTCHN_FIFO_PRIORITY_DEFAULT), Some(c));
    assert_pending_mirror(&domain, &ports);
}
