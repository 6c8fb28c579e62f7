//! Page-granular storage for channels and event words, and the address
//! translator from ports into it.
//!
//! Ports are split across two arenas of 4 KiB pages:
//!
//! - **Channel pages** are host memory, allocated when the first port on a
//!   page is made.
//! - **Word pages** are guest frames, handed over one at a time by
//!   `EVTCHNOP_expand_array` and mapped through the HAL.
//!
//! Both arenas only grow. A slot is written once and published by bumping the
//! arena length, so lookups on the hot path take no lock.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

use axaddrspace::{GuestPhysAddr, HostVirtAddr};
use axerrno::{AxResult, ax_err};
use memory_addr::PAGE_SIZE_4K;
use spin::Once;

use crate::abi::{EVTCHN_FIFO_NR_CHANNELS, Port};
use crate::channel::Channel;
use crate::fifo::EventWord;

/// Size of one event word.
pub const WORD_SIZE: usize = core::mem::size_of::<EventWord>();
/// Size of one channel descriptor.
pub const CHAN_SIZE: usize = core::mem::size_of::<Channel>();

/// Event words per guest page.
pub const WORDS_PER_PAGE: usize = PAGE_SIZE_4K / WORD_SIZE;
/// Channel descriptors per host page.
pub const CHANS_PER_PAGE: usize = PAGE_SIZE_4K / CHAN_SIZE;

const PORT_MASK: usize = EVTCHN_FIFO_NR_CHANNELS - 1;
const WORD_MASK: usize = WORDS_PER_PAGE - 1;
const CHAN_MASK: usize = CHANS_PER_PAGE - 1;
const WORD_PAGE_MASK: usize = PORT_MASK & !WORD_MASK;
const CHAN_PAGE_MASK: usize = PORT_MASK & !CHAN_MASK;
const WORD_PAGE_SHIFT: u32 = WORDS_PER_PAGE.trailing_zeros();
const CHAN_PAGE_SHIFT: u32 = CHANS_PER_PAGE.trailing_zeros();

const _: () = assert!(EVTCHN_FIFO_NR_CHANNELS.is_power_of_two());
const _: () = assert!(WORD_SIZE.is_power_of_two());
const _: () = assert!(CHAN_SIZE.is_power_of_two());
const _: () = assert!(CHAN_SIZE < PAGE_SIZE_4K);
const _: () = assert!(CHAN_SIZE > WORD_SIZE);

/// Page index of `port` in the word arena.
#[inline]
pub const fn port_to_word_page(port: Port) -> usize {
    (port as usize & WORD_PAGE_MASK) >> WORD_PAGE_SHIFT
}

/// Page index of `port` in the channel arena.
#[inline]
pub const fn port_to_chan_page(port: Port) -> usize {
    (port as usize & CHAN_PAGE_MASK) >> CHAN_PAGE_SHIFT
}

#[inline]
const fn word_offset(port: Port) -> usize {
    port as usize & WORD_MASK
}

#[inline]
const fn chan_offset(port: Port) -> usize {
    port as usize & CHAN_MASK
}

/// Converts a guest frame number into the address of the frame.
pub fn gfn_to_gpa(gfn: u64) -> AxResult<GuestPhysAddr> {
    match usize::try_from(gfn)
        .ok()
        .and_then(|gfn| gfn.checked_mul(PAGE_SIZE_4K))
    {
        Some(addr) => Ok(GuestPhysAddr::from(addr)),
        None => ax_err!(InvalidInput, "guest frame number out of range"),
    }
}

/// A guest frame mapped into host-virtual memory.
pub struct GuestFrame {
    gpa: GuestPhysAddr,
    hva: HostVirtAddr,
}

impl GuestFrame {
    /// Wraps a mapping obtained from the HAL.
    ///
    /// # Safety
    ///
    /// `hva` must be page aligned and map `PAGE_SIZE_4K` bytes that stay
    /// valid for as long as the returned value exists.
    pub unsafe fn new(gpa: GuestPhysAddr, hva: HostVirtAddr) -> Self {
        debug_assert!(memory_addr::is_aligned(hva.as_usize(), PAGE_SIZE_4K));
        Self { gpa, hva }
    }

    /// Guest physical address of the frame.
    pub fn gpa(&self) -> GuestPhysAddr {
        self.gpa
    }

    /// Host virtual address of the mapping.
    pub fn hva(&self) -> HostVirtAddr {
        self.hva
    }

    /// Views the frame as event words.
    pub fn words(&self) -> &[EventWord] {
        // SAFETY: the frame is mapped, page aligned and at least one page
        // long; `EventWord` is an `AtomicU32`, valid for any bit pattern and
        // sound to share with a concurrently writing guest.
        unsafe {
            core::slice::from_raw_parts(self.hva.as_usize() as *const EventWord, WORDS_PER_PAGE)
        }
    }
}

impl core::fmt::Debug for GuestFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuestFrame")
            .field("gpa", &format_args!("{:#x}", self.gpa.as_usize()))
            .field("hva", &format_args!("{:#x}", self.hva.as_usize()))
            .finish()
    }
}

/// Append-only arena of pages indexed by page number.
///
/// Appending must be serialised by the caller; reading never blocks.
pub struct PagePool<P> {
    slots: Box<[Once<P>]>,
    len: AtomicUsize,
}

impl<P> PagePool<P> {
    /// Creates an empty pool able to hold `capacity` pages.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Once::new()).collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of pages published so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Maximum number of pages.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Publishes `page` as the next page and returns its index.
    pub fn push(&self, page: P) -> AxResult<usize> {
        let index = self.len.load(Ordering::Acquire);
        let Some(slot) = self.slots.get(index) else {
            return ax_err!(NoMemory, "page pool exhausted");
        };
        slot.call_once(|| page);
        self.len.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// Page `index`, if it has been published.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&P> {
        if index >= self.len() {
            return None;
        }
        self.slots[index].get()
    }

    /// Iterates over the published pages in order.
    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.slots[..self.len()].iter().filter_map(Once::get)
    }
}

/// Channel and word storage of one event-channel instance.
pub struct PortSpace {
    max_ports: usize,
    chans: PagePool<Box<[Channel]>>,
    words: PagePool<GuestFrame>,
}

impl PortSpace {
    pub fn new(max_ports: usize) -> Self {
        Self {
            max_ports,
            chans: PagePool::new(max_ports.div_ceil(CHANS_PER_PAGE)),
            words: PagePool::new(max_ports.div_ceil(WORDS_PER_PAGE)),
        }
    }

    /// Ports are valid in `[0, max_ports)`.
    #[inline]
    pub fn max_ports(&self) -> usize {
        self.max_ports
    }

    #[inline]
    pub fn in_range(&self, port: Port) -> bool {
        (port as usize) < self.max_ports
    }

    /// Channel of `port`, or `None` if its page has not been made yet.
    pub fn port_to_chan(&self, port: Port) -> Option<&Channel> {
        if !self.in_range(port) {
            return None;
        }
        let page = self.chans.get(port_to_chan_page(port))?;
        page.get(chan_offset(port))
    }

    /// Event word of `port`, or `None` if the guest has not provided its page.
    pub fn port_to_word(&self, port: Port) -> Option<&EventWord> {
        if !self.in_range(port) {
            return None;
        }
        let page = self.words.get(port_to_word_page(port))?;
        page.words().get(word_offset(port))
    }

    /// Makes sure the channel page holding `port` exists, allocating it and
    /// every page before it as needed.
    ///
    /// Must be called with the instance's administrative lock held.
    pub fn make_chan_page(&self, port: Port) -> AxResult<&Channel> {
        if !self.in_range(port) {
            return ax_err!(NotFound, "port out of range");
        }
        let target = port_to_chan_page(port);
        while self.chans.len() <= target {
            let base = (self.chans.len() * CHANS_PER_PAGE) as Port;
            let page: Box<[Channel]> = (0..CHANS_PER_PAGE as Port)
                .map(|offset| Channel::new(base + offset))
                .collect();
            let index = self.chans.push(page)?;
            trace!("channel page {} covers ports {}..{}", index, base, base as usize + CHANS_PER_PAGE);
        }
        match self.port_to_chan(port) {
            Some(chan) => Ok(chan),
            None => ax_err!(BadState, "channel page missing after allocation"),
        }
    }

    /// Appends a guest word page.
    ///
    /// Must be called with the instance's administrative lock held.
    pub fn add_word_page(&self, frame: GuestFrame) -> AxResult<usize> {
        self.words.push(frame)
    }

    /// Number of word pages the guest has provided.
    pub fn word_pages(&self) -> usize {
        self.words.len()
    }

    /// Whether no further word page can be added.
    pub fn word_pages_full(&self) -> bool {
        self.words.is_full()
    }

    /// Number of channel pages allocated.
    #[cfg(test)]
    pub fn chan_pages(&self) -> usize {
        self.chans.len()
    }

    /// Mapped word frames, in page order.
    pub fn word_frames(&self) -> impl Iterator<Item = &GuestFrame> {
        self.words.iter()
    }
}
