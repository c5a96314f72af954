//! Driver side of a split virtqueue, for exercising ports the way a
//! guest would: free-list descriptor management, chaining, available
//! publication and used-ring consumption with explicit fences.

use std::io;
use std::sync::atomic::{Ordering, fence};

use vm_memory::{Bytes, GuestAddress, GuestMemory};

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

const DESC_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4; // flags(2) + idx(2)
const AVAIL_RING_ELEM: u64 = 2;
const USED_RING_HEADER: u64 = 4; // flags(2) + idx(2)
const USED_RING_ELEM: u64 = 8; // id(4) + len(4)

/// One completed buffer from the used ring.
#[derive(Debug)]
pub struct UsedElem {
    pub head: u16,
    pub len: u32,
}

/// Guest-side queue state over ring structures in guest memory.
pub struct DriverQueue {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,

    free_head: u16,
    num_free: u16,
    avail_idx_shadow: u16,
    last_used_idx: u16,
    /// Chain length per head, for returning descriptors to the free
    /// list.
    chain_len: Vec<u16>,
}

impl DriverQueue {
    pub fn new(size: u16, base_addr: u64) -> Self {
        let desc_addr = base_addr;
        let avail_addr = desc_addr + u64::from(size) * DESC_SIZE;
        let avail_size = AVAIL_RING_HEADER + u64::from(size) * AVAIL_RING_ELEM + 2;
        let used_addr = (avail_addr + avail_size + 3) & !3;

        DriverQueue {
            size,
            desc_addr,
            avail_addr,
            used_addr,
            free_head: 0,
            num_free: size,
            avail_idx_shadow: 0,
            last_used_idx: 0,
            chain_len: vec![0; usize::from(size)],
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_addr(&self) -> u64 {
        self.desc_addr
    }

    pub fn avail_addr(&self) -> u64 {
        self.avail_addr
    }

    pub fn used_addr(&self) -> u64 {
        self.used_addr
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Zero the rings and link the descriptor free list.
    pub fn init<M: GuestMemory>(&mut self, mem: &M) -> io::Result<()> {
        let total = u64::from(self.size) * DESC_SIZE
            + (AVAIL_RING_HEADER + u64::from(self.size) * AVAIL_RING_ELEM + 2)
            + (USED_RING_HEADER + u64::from(self.size) * USED_RING_ELEM + 2)
            + 8;
        let zeros = vec![0u8; total as usize];
        mem.write_slice(&zeros, GuestAddress(self.desc_addr))
            .map_err(|e| io::Error::other(format!("zeroing rings: {e:?}")))?;

        for i in 0..self.size {
            let next = if i == self.size - 1 { 0 } else { i + 1 };
            mem.write_obj(next, GuestAddress(self.desc_offset(i) + 14))
                .map_err(|e| io::Error::other(format!("free list: {e:?}")))?;
        }

        self.free_head = 0;
        self.num_free = self.size;
        self.avail_idx_shadow = 0;
        self.last_used_idx = 0;
        Ok(())
    }

    fn desc_offset(&self, idx: u16) -> u64 {
        self.desc_addr + u64::from(idx) * DESC_SIZE
    }

    fn read_next<M: GuestMemory>(&self, mem: &M, idx: u16) -> u16 {
        mem.read_obj(GuestAddress(self.desc_offset(idx) + 14))
            .expect("descriptor table readable")
    }

    fn write_desc<M: GuestMemory>(
        &self,
        mem: &M,
        idx: u16,
        addr: u64,
        len: u32,
        mut flags: u16,
        has_next: bool,
    ) {
        if has_next {
            flags |= VIRTQ_DESC_F_NEXT;
        }
        let off = self.desc_offset(idx);
        mem.write_obj(addr, GuestAddress(off)).unwrap();
        mem.write_obj(len, GuestAddress(off + 8)).unwrap();
        mem.write_obj(flags, GuestAddress(off + 12)).unwrap();
    }

    /// Chain `buffers` and publish the head on the available ring.
    /// `write` marks the buffers device-writable (RX).
    pub fn add_buf<M: GuestMemory>(
        &mut self,
        mem: &M,
        buffers: &[(u64, u32)],
        write: bool,
    ) -> io::Result<u16> {
        if buffers.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty chain"));
        }
        if buffers.len() > usize::from(self.num_free) {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "ring full"));
        }

        let flags = if write { VIRTQ_DESC_F_WRITE } else { 0 };
        let head = self.free_head;
        let mut idx = head;
        let mut last = head;
        for (i, &(addr, len)) in buffers.iter().enumerate() {
            let has_next = i != buffers.len() - 1;
            self.write_desc(mem, idx, addr, len, flags, has_next);
            last = idx;
            idx = self.read_next(mem, idx);
        }

        self.free_head = self.read_next(mem, last);
        self.num_free -= buffers.len() as u16;
        self.chain_len[usize::from(head)] = buffers.len() as u16;

        self.publish_avail(mem, head);
        Ok(head)
    }

    /// Publish an arbitrary head index without touching descriptors;
    /// used to feed the device hostile ring content.
    pub fn publish_raw_head<M: GuestMemory>(&mut self, mem: &M, head: u16) {
        self.publish_avail(mem, head);
    }

    fn publish_avail<M: GuestMemory>(&mut self, mem: &M, head: u16) {
        let slot = self.avail_idx_shadow % self.size;
        mem.write_obj(
            head,
            GuestAddress(self.avail_addr + AVAIL_RING_HEADER + u64::from(slot) * AVAIL_RING_ELEM),
        )
        .unwrap();

        // The head must be visible before the index moves.
        fence(Ordering::Release);
        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        mem.write_obj(self.avail_idx_shadow, GuestAddress(self.avail_addr + 2))
            .unwrap();
    }

    /// Rewrite a descriptor in place (to corrupt chains under test).
    pub fn patch_desc<M: GuestMemory>(
        &self,
        mem: &M,
        idx: u16,
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) {
        let off = self.desc_offset(idx);
        mem.write_obj(addr, GuestAddress(off)).unwrap();
        mem.write_obj(len, GuestAddress(off + 8)).unwrap();
        mem.write_obj(flags, GuestAddress(off + 12)).unwrap();
        mem.write_obj(next, GuestAddress(off + 14)).unwrap();
    }

    /// Number of used entries the device has published and we have
    /// not consumed.
    pub fn used_pending<M: GuestMemory>(&self, mem: &M) -> u16 {
        let used_idx: u16 = mem.read_obj(GuestAddress(self.used_addr + 2)).unwrap();
        used_idx.wrapping_sub(self.last_used_idx)
    }

    /// Consume one used entry, returning the chain to the free list.
    pub fn pop_used<M: GuestMemory>(&mut self, mem: &M) -> Option<UsedElem> {
        if self.used_pending(mem) == 0 {
            return None;
        }
        fence(Ordering::Acquire);

        let slot = self.last_used_idx % self.size;
        let off = self.used_addr + USED_RING_HEADER + u64::from(slot) * USED_RING_ELEM;
        let id: u32 = mem.read_obj(GuestAddress(off)).unwrap();
        let len: u32 = mem.read_obj(GuestAddress(off + 4)).unwrap();
        let head = id as u16;

        let count = self.chain_len[usize::from(head)].max(1);
        let mut tail = head;
        for _ in 0..count - 1 {
            tail = self.read_next(mem, tail);
        }
        mem.write_obj(self.free_head, GuestAddress(self.desc_offset(tail) + 14))
            .unwrap();
        self.free_head = head;
        self.num_free += count;

        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some(UsedElem { head, len })
    }
}
