//! Bounded source-MAC learning table.

use std::collections::HashMap;

use tracing::debug;

use crate::mac_addr::MacAddr;

/// Arena index of a port in the switch's port array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub u16);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    port: Option<PortId>,
    addr: MacAddr,
    vlan: u16,
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            port: None,
            addr: MacAddr::UNKNOWN,
            vlan: 0,
        }
    }
}

/// Maps `(MAC, VLAN)` to the port it was last seen on.
///
/// A port may be associated with many addresses (a bridge behind it),
/// so the association is 1:n. Capacity is fixed; once full, inserts
/// overwrite slots round-robin. Eviction is deliberately coarse: an
/// evicted address simply floods again until relearned.
pub struct MacTable {
    map: HashMap<(MacAddr, u16), usize>,
    entries: Vec<Entry>,
    rr_index: usize,
}

impl MacTable {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        MacTable {
            map: HashMap::with_capacity(capacity),
            entries: vec![Entry::default(); capacity],
            rr_index: 0,
        }
    }

    /// Find the port for a destination address, exact key match only.
    pub fn lookup(&self, dst: MacAddr, vlan: u16) -> Option<PortId> {
        self.map
            .get(&(dst, vlan))
            .and_then(|&slot| self.entries[slot].port)
    }

    /// Record that `src` was seen on `port`.
    ///
    /// A known key only has its port updated, so a client moving
    /// between ports heals on its next frame. An unknown key claims
    /// the round-robin slot, evicting whatever held it.
    pub fn learn(&mut self, src: MacAddr, port: PortId, vlan: u16) {
        match self.map.entry((src, vlan)) {
            std::collections::hash_map::Entry::Occupied(e) => {
                let slot = *e.get();
                if self.entries[slot].port != Some(port) {
                    debug!(target: "port", mac = %src, vlan, port = %port, "station moved");
                    self.entries[slot].port = Some(port);
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                let slot = self.rr_index;
                e.insert(slot);
                let evicted = self.entries[slot];
                if evicted.port.is_some() {
                    self.map.remove(&(evicted.addr, evicted.vlan));
                }
                self.entries[slot] = Entry {
                    port: Some(port),
                    addr: src,
                    vlan,
                };
                self.rr_index = (self.rr_index + 1) % self.entries.len();
                debug!(target: "port", mac = %src, vlan, port = %port, "learned");
            }
        }
    }

    /// Remove every association with `port`.
    ///
    /// Must run before the port object is dropped so no stale handle
    /// survives in the table.
    pub fn flush(&mut self, port: PortId) {
        let entries = &mut self.entries;
        self.map.retain(|_, &mut slot| {
            if entries[slot].port == Some(port) {
                entries[slot] = Entry::default();
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
