//! Device side of a split virtqueue in guest-shared memory.
//!
//! Single-thread invariant: queues are owned by the engine task and
//! never shared across execution contexts, so the notification
//! suppression latch is plain state, not atomics. The fences order
//! our accesses against the guest-side driver only.

use std::num::Wrapping;
use std::sync::atomic::{Ordering, fence};

use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use super::BadDescriptor;

const DESC_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4; // flags(2) + idx(2)
const AVAIL_RING_ELEM: u64 = 2;
const USED_RING_HEADER: u64 = 4; // flags(2) + idx(2)
const USED_RING_ELEM: u64 = 8; // id(4) + len(4)

const VRING_USED_F_NO_NOTIFY: u16 = 1;
const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Rejected queue layout from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueConfigError {
    #[error("queue size must be a power of two within the advertised maximum")]
    InvalidSize,
    #[error("ring addresses outside registered dataspaces")]
    Unmapped,
}

/// One TX or RX queue of a port.
#[derive(Debug)]
pub struct Virtqueue {
    size: u16,
    ready: bool,
    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,
    /// Logical cursor into the available ring (free-running).
    next_avail: Wrapping<u16>,
    /// Shadow of the published used index (free-running).
    used_idx: Wrapping<u16>,
    kick_enabled: bool,
    kick_pending: bool,
}

impl Virtqueue {
    pub fn new() -> Self {
        Virtqueue {
            size: 0,
            ready: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            used_idx: Wrapping(0),
            kick_enabled: true,
            kick_pending: false,
        }
    }

    /// Validate and adopt a driver-supplied layout; the queue becomes
    /// ready.
    pub fn configure(
        &mut self,
        mem: &GuestMemoryMmap,
        size: u16,
        vq_max: u16,
        desc_table: GuestAddress,
        avail_ring: GuestAddress,
        used_ring: GuestAddress,
    ) -> Result<(), QueueConfigError> {
        if size == 0 || size > vq_max || !size.is_power_of_two() {
            return Err(QueueConfigError::InvalidSize);
        }
        let s = u64::from(size);
        for (addr, len) in [
            (desc_table, s * DESC_SIZE),
            (avail_ring, AVAIL_RING_HEADER + s * AVAIL_RING_ELEM),
            (used_ring, USED_RING_HEADER + s * USED_RING_ELEM),
        ] {
            mem.get_slice(addr, len as usize)
                .map_err(|_| QueueConfigError::Unmapped)?;
        }

        self.size = size;
        self.desc_table = desc_table;
        self.avail_ring = avail_ring;
        self.used_ring = used_ring;
        self.next_avail = Wrapping(0);
        self.used_idx = Wrapping(0);
        self.kick_enabled = true;
        self.kick_pending = false;
        self.ready = true;
        Ok(())
    }

    pub fn disable(&mut self) {
        self.ready = false;
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_table(&self) -> GuestAddress {
        self.desc_table
    }

    fn avail_idx(&self, mem: &GuestMemoryMmap) -> Result<Wrapping<u16>, BadDescriptor> {
        let idx: u16 = mem
            .read_obj(GuestAddress(self.avail_ring.0 + 2))
            .map_err(|_| BadDescriptor::RingUnreadable)?;
        Ok(Wrapping(idx))
    }

    /// Whether the driver has published heads we have not consumed.
    pub fn desc_avail(&self, mem: &GuestMemoryMmap) -> bool {
        self.ready
            && self
                .avail_idx(mem)
                .map(|idx| idx != self.next_avail)
                .unwrap_or(false)
    }

    /// Consume the next available head, if any.
    pub fn next_avail(&mut self, mem: &GuestMemoryMmap) -> Result<Option<u16>, BadDescriptor> {
        if !self.ready {
            return Ok(None);
        }
        if self.avail_idx(mem)? == self.next_avail {
            return Ok(None);
        }
        // Pair with the driver's publish of avail->idx.
        fence(Ordering::Acquire);

        let slot = self.next_avail.0 % self.size;
        let head: u16 = mem
            .read_obj(GuestAddress(
                self.avail_ring.0 + AVAIL_RING_HEADER + u64::from(slot) * AVAIL_RING_ELEM,
            ))
            .map_err(|_| BadDescriptor::RingUnreadable)?;
        if head >= self.size {
            return Err(BadDescriptor::IndexOutOfRange);
        }
        self.next_avail += 1;
        Ok(Some(head))
    }

    /// Current logical position of the avail cursor; pass back to
    /// [`Self::rewind_avail_to`] to retry heads consumed after this
    /// point.
    pub fn avail_pos(&self) -> u16 {
        self.next_avail.0
    }

    /// Roll the avail cursor back so partially consumed heads are
    /// popped again later. Only legal while none of them has been
    /// published on the used ring.
    pub fn rewind_avail_to(&mut self, pos: u16) {
        self.next_avail = Wrapping(pos);
    }

    fn add_used_at(
        &self,
        mem: &GuestMemoryMmap,
        idx: Wrapping<u16>,
        head: u16,
        len: u32,
    ) -> Result<(), BadDescriptor> {
        let slot = idx.0 % self.size;
        let addr = self.used_ring.0 + USED_RING_HEADER + u64::from(slot) * USED_RING_ELEM;
        mem.write_obj(u32::from(head), GuestAddress(addr))
            .map_err(|_| BadDescriptor::RingUnreadable)?;
        mem.write_obj(len, GuestAddress(addr + 4))
            .map_err(|_| BadDescriptor::RingUnreadable)?;
        Ok(())
    }

    fn publish_used(&mut self, mem: &GuestMemoryMmap, count: u16) -> Result<(), BadDescriptor> {
        // Entries must be visible before the index moves.
        fence(Ordering::Release);
        self.used_idx += count;
        mem.write_obj(self.used_idx.0, GuestAddress(self.used_ring.0 + 2))
            .map_err(|_| BadDescriptor::RingUnreadable)
    }

    /// Publish one completed head. Returns whether the driver should
    /// be interrupted now (subject to the suppression latch).
    pub fn finish(
        &mut self,
        mem: &GuestMemoryMmap,
        head: u16,
        len: u32,
    ) -> Result<bool, BadDescriptor> {
        self.add_used_at(mem, self.used_idx, head, len)?;
        self.publish_used(mem, 1)?;
        Ok(self.kick_queue(mem))
    }

    /// Publish a merge-rx batch of completed heads as one unit.
    pub fn finish_batch(
        &mut self,
        mem: &GuestMemoryMmap,
        entries: &[(u16, u32)],
    ) -> Result<bool, BadDescriptor> {
        for (i, &(head, len)) in entries.iter().enumerate() {
            self.add_used_at(mem, self.used_idx + Wrapping(i as u16), head, len)?;
        }
        self.publish_used(mem, entries.len() as u16)?;
        Ok(self.kick_queue(mem))
    }

    fn no_notify_guest(&self, mem: &GuestMemoryMmap) -> bool {
        mem.read_obj::<u16>(self.avail_ring)
            .map(|flags| flags & VRING_AVAIL_F_NO_INTERRUPT != 0)
            .unwrap_or(true)
    }

    /// Ask for a driver interrupt; honors both the driver's
    /// NO_INTERRUPT flag and the engine's suppression latch. A
    /// suppressed kick is remembered.
    pub fn kick_queue(&mut self, mem: &GuestMemoryMmap) -> bool {
        if self.no_notify_guest(mem) {
            return false;
        }
        if self.kick_enabled {
            return true;
        }
        self.kick_pending = true;
        false
    }

    /// Suppress driver interrupts for this queue; pending kicks are
    /// discarded (a fresh drain is starting).
    pub fn kick_disable_and_remember(&mut self) {
        self.kick_enabled = false;
        self.kick_pending = false;
    }

    /// Re-enable driver interrupts; returns whether a kick was
    /// swallowed while suppressed and must be emitted now.
    pub fn kick_enable_get_pending(&mut self) -> bool {
        self.kick_enabled = true;
        std::mem::take(&mut self.kick_pending)
    }

    /// Tell the driver not to kick us (we are polling).
    pub fn disable_notify(&self, mem: &GuestMemoryMmap) {
        if self.ready {
            let _ = mem.write_obj(VRING_USED_F_NO_NOTIFY, self.used_ring);
        }
    }

    /// Ask the driver to kick us again for new heads.
    pub fn enable_notify(&self, mem: &GuestMemoryMmap) {
        if self.ready {
            let _ = mem.write_obj(0u16, self.used_ring);
        }
    }
}

impl Default for Virtqueue {
    fn default() -> Self {
        Self::new()
    }
}
