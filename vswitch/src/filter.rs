//! Mirror-path packet filtering.

use smoltcp::wire::{EthernetFrame, EthernetProtocol};

/// Minimum frame length before a filter is consulted.
const MIN_FRAME_LEN: usize = 14;

/// Decides which frames reach the monitor port.
///
/// Only the mirror copy is filtered; the primary delivery path never
/// consults the filter.
pub trait PacketFilter: Send {
    /// `true` drops the mirror copy of the frame.
    fn should_drop(&self, frame: &[u8]) -> bool;
}

/// Default filter: mirror everything.
pub struct AllowAll;

impl PacketFilter for AllowAll {
    fn should_drop(&self, _frame: &[u8]) -> bool {
        false
    }
}

/// Drops configured ethertypes from the mirror, except ARP which is
/// always forwarded so the monitor keeps seeing address resolution.
pub struct EtherTypeFilter {
    dropped: Vec<EthernetProtocol>,
}

impl EtherTypeFilter {
    pub fn new(dropped: Vec<EthernetProtocol>) -> Self {
        EtherTypeFilter { dropped }
    }
}

impl PacketFilter for EtherTypeFilter {
    fn should_drop(&self, frame: &[u8]) -> bool {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return false;
        };
        let ethertype = eth.ethertype();
        if ethertype == EthernetProtocol::Arp {
            return false;
        }
        self.dropped.contains(&ethertype)
    }
}

/// Apply `filter` to the available prefix of a frame.
pub fn filter_frame(filter: &dyn PacketFilter, prefix: &[u8]) -> bool {
    if prefix.len() < MIN_FRAME_LEN {
        return false;
    }
    filter.should_drop(prefix)
}
