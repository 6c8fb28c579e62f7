use axerrno::{AxResult, ax_err};

use crate::abi::{DOMID_FIRST_RESERVED, DomainId, EVTCHN_FIFO_NR_CHANNELS};
use crate::pool::{CHANS_PER_PAGE, WORDS_PER_PAGE};

/// Number of physical IRQs a domain may bind by default.
pub const DEFAULT_NR_PIRQS: u32 = 256;

/// The configuration of one event-channel instance.
#[derive(Debug, Clone)]
pub struct EvtchnConfig {
    /// Domain owning the ports.
    pub domid: DomainId,
    /// Number of vCPUs of the domain.
    pub nr_vcpus: usize,
    /// Port limit, a power of two no larger than the FIFO ABI allows.
    pub max_ports: usize,
    /// Number of physical IRQs the domain may bind.
    pub nr_pirqs: u32,
}

/// The implemention for EvtchnConfig
impl EvtchnConfig {
    /// Config with the full FIFO port range.
    pub fn new(domid: DomainId, nr_vcpus: usize) -> Self {
        Self {
            domid,
            nr_vcpus,
            max_ports: EVTCHN_FIFO_NR_CHANNELS,
            nr_pirqs: DEFAULT_NR_PIRQS,
        }
    }

    /// Limits the number of ports.
    pub fn with_max_ports(mut self, max_ports: usize) -> Self {
        self.max_ports = max_ports;
        self
    }

    /// Sets the number of bindable physical IRQs.
    pub fn with_nr_pirqs(mut self, nr_pirqs: u32) -> Self {
        self.nr_pirqs = nr_pirqs;
        self
    }

    /// Checks the configuration before an instance is built from it.
    pub fn validate(&self) -> AxResult {
        if self.domid >= DOMID_FIRST_RESERVED {
            return ax_err!(InvalidInput, "reserved domain id");
        }
        if self.nr_vcpus == 0 {
            return ax_err!(InvalidInput, "domain has no vCPU");
        }
        if !self.max_ports.is_power_of_two()
            || self.max_ports > EVTCHN_FIFO_NR_CHANNELS
            || self.max_ports < WORDS_PER_PAGE.max(CHANS_PER_PAGE)
        {
            return ax_err!(InvalidInput, "max_ports out of range");
        }
        Ok(())
    }

    /// Number of guest word pages needed to cover every port.
    pub fn max_word_pages(&self) -> usize {
        self.max_ports / WORDS_PER_PAGE
    }

    /// Number of channel pages needed to cover every port.
    pub fn max_chan_pages(&self) -> usize {
        self.max_ports / CHANS_PER_PAGE
    }
}
