//! Atomic event words shared with the guest.
//!
//! An event word is a 32-bit value in guest memory:
//!
//! ```text
//!  31       30      29       28      27 .. 17   16 .. 0
//! ┌────────┬───────┬────────┬──────┬──────────┬──────────┐
//! │PENDING │MASKED │ LINKED │ BUSY │ reserved │   LINK   │
//! └────────┴───────┴────────┴──────┴──────────┴──────────┘
//! ```
//!
//! The guest may read and write the word at any time, so every access is a
//! single atomic instruction or a compare-and-swap loop. There is never a
//! plain load followed by a separate store.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::abi::{
    EVTCHN_FIFO_BUSY, EVTCHN_FIFO_LINK_MASK, EVTCHN_FIFO_LINKED, EVTCHN_FIFO_MASKED,
    EVTCHN_FIFO_PENDING, Port,
};

bitflags! {
    /// Snapshot of the flag bits of an event word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventWordFlags: u32 {
        const PENDING = 1 << EVTCHN_FIFO_PENDING;
        const MASKED = 1 << EVTCHN_FIFO_MASKED;
        const LINKED = 1 << EVTCHN_FIFO_LINKED;
        const BUSY = 1 << EVTCHN_FIFO_BUSY;
    }
}

/// Attempts at claiming BUSY on a word before taking it over.
const LINK_RETRIES: usize = 64;

/// One event word, viewed in place inside a mapped guest page.
#[repr(transparent)]
pub struct EventWord(AtomicU32);

const _: () = assert!(core::mem::size_of::<EventWord>().is_power_of_two());
const _: () = assert!(core::mem::size_of::<EventWord>() == 4);

macro_rules! word_flag_ops {
    ($flag:ident, $is:ident, $set:ident, $test_and_set:ident, $clear:ident, $test_and_clear:ident) => {
        #[inline]
        pub fn $is(&self) -> bool {
            self.0.load(Ordering::Acquire) & EventWordFlags::$flag.bits() != 0
        }

        #[inline]
        pub fn $set(&self) {
            self.0.fetch_or(EventWordFlags::$flag.bits(), Ordering::AcqRel);
        }

        /// Sets the flag, returning whether it was already set.
        #[inline]
        pub fn $test_and_set(&self) -> bool {
            self.0.fetch_or(EventWordFlags::$flag.bits(), Ordering::AcqRel)
                & EventWordFlags::$flag.bits()
                != 0
        }

        #[inline]
        pub fn $clear(&self) {
            self.0.fetch_and(!EventWordFlags::$flag.bits(), Ordering::AcqRel);
        }

        /// Clears the flag, returning whether it was set.
        #[inline]
        pub fn $test_and_clear(&self) -> bool {
            self.0.fetch_and(!EventWordFlags::$flag.bits(), Ordering::AcqRel)
                & EventWordFlags::$flag.bits()
                != 0
        }
    };
}

impl EventWord {
    /// A word with every bit clear.
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    word_flag_ops!(
        PENDING,
        is_pending,
        set_pending,
        test_and_set_pending,
        clear_pending,
        test_and_clear_pending
    );
    word_flag_ops!(
        MASKED,
        is_masked,
        set_masked,
        test_and_set_masked,
        clear_masked,
        test_and_clear_masked
    );
    word_flag_ops!(
        LINKED,
        is_linked,
        set_linked,
        test_and_set_linked,
        clear_linked,
        test_and_clear_linked
    );
    word_flag_ops!(
        BUSY,
        is_busy,
        set_busy,
        test_and_set_busy,
        clear_busy,
        test_and_clear_busy
    );

    /// Current flag bits.
    #[inline]
    pub fn flags(&self) -> EventWordFlags {
        EventWordFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Port the link field points at.
    #[inline]
    pub fn link(&self) -> Port {
        self.0.load(Ordering::Acquire) & EVTCHN_FIFO_LINK_MASK
    }

    /// Raw value, for diagnostics.
    #[inline]
    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Clears every bit, used when a fresh page is handed to the core.
    #[inline]
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Replaces the link field, leaving the flag bits as they are.
    pub fn set_link(&self, link: Port) {
        let link = link & EVTCHN_FIFO_LINK_MASK;
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let new = (current & !EVTCHN_FIFO_LINK_MASK) | link;
            match self
                .0
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Points a queued word at the next port in its queue.
    ///
    /// Returns `false` only when the word is seen without LINKED: the guest
    /// has consumed it and the caller must start a new queue instead. BUSY
    /// is held around the link update so an unlink of the same word waits
    /// for it. If BUSY stays set past a bounded number of attempts it is
    /// taken over: a word that is still LINKED always gets the link.
    pub fn link_after(&self, link: Port) -> bool {
        let link = link & EVTCHN_FIFO_LINK_MASK;

        let mut claimed = false;
        for _ in 0..LINK_RETRIES {
            if !self.is_linked() {
                return false;
            }
            if !self.test_and_set_busy() {
                claimed = true;
                break;
            }
            core::hint::spin_loop();
        }
        if !claimed {
            warn!("event word held BUSY too long, taking it over to link port {}", link);
            self.set_busy();
        }

        let mut current = self.0.load(Ordering::Acquire);
        let linked = loop {
            if current & EventWordFlags::LINKED.bits() == 0 {
                break false;
            }
            let new = (current & !EVTCHN_FIFO_LINK_MASK) | link;
            match self
                .0
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break true,
                Err(actual) => current = actual,
            }
        };

        self.clear_busy();
        linked
    }

    /// Detaches a consumed word from its queue, returning its old link.
    ///
    /// Spins while another party holds BUSY. This is what a draining guest
    /// does; the core only uses it from its diagnostics and tests.
    pub fn unlink(&self) -> Port {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & EventWordFlags::BUSY.bits() != 0 {
                core::hint::spin_loop();
                current = self.0.load(Ordering::Acquire);
                continue;
            }
            let new = current & !(EventWordFlags::LINKED.bits() | EVTCHN_FIFO_LINK_MASK);
            match self
                .0
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current & EVTCHN_FIFO_LINK_MASK,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for EventWord {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventWord")
            .field("flags", &self.flags())
            .field("link", &self.link())
            .finish()
    }
}
