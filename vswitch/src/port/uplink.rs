//! Switch port backed by a real NIC driver.
//!
//! The driver itself lives behind [`NicDriver`]; the port owns the
//! batching and the fixed-slot mempool that feeds the NIC TX ring.

use std::collections::VecDeque;

use tracing::trace;
use vmm_sys_util::eventfd::EventFd;

use crate::mac_addr::MacAddr;
use crate::request::{HostTransfer, SourceTransfer};
use crate::virtio::chain::FrameSink;
use crate::virtio::{BadDescriptor, CopyFault, SlotSink};
use crate::vlan::{PortRole, RoleKind, VLAN_ID_NATIVE};

use super::DeliverResult;

/// Frames pulled off the NIC per batch.
pub const TX_BATCH_SIZE: usize = 32;
/// Mempool geometry.
pub const NUM_BUFS: usize = 1024;
pub const BUF_SIZE: usize = 2048;

/// One packet buffer travelling between the port and the driver.
pub struct PktBufSlot {
    pub data: Box<[u8]>,
    pub len: usize,
}

/// Fixed-size packet buffer pool for the NIC TX path.
///
/// `alloc` hands a slot out, `free` returns it; slots handed to the
/// driver come back through [`NicDriver::tx_reclaim`].
pub struct Mempool {
    free: Vec<Box<[u8]>>,
    slot_size: usize,
}

impl Mempool {
    pub fn new(num_bufs: usize, slot_size: usize) -> Self {
        Mempool {
            free: (0..num_bufs)
                .map(|_| vec![0u8; slot_size].into_boxed_slice())
                .collect(),
            slot_size,
        }
    }

    pub fn alloc(&mut self) -> Option<Box<[u8]>> {
        self.free.pop()
    }

    pub fn free(&mut self, slot: Box<[u8]>) {
        debug_assert_eq!(slot.len(), self.slot_size);
        self.free.push(slot);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// The surface the switch consumes from a NIC driver.
pub trait NicDriver: Send {
    fn driver_name(&self) -> &str;

    fn mac(&self) -> MacAddr;

    /// Pull up to `num` received frames into `bufs`; returns how many
    /// were appended. The driver allocates the slots.
    fn rx_batch(&mut self, queue: u16, bufs: &mut VecDeque<PktBufSlot>, num: usize) -> usize;

    /// Submit frames for transmission; the driver pops what it
    /// accepts off the front of `bufs` and owns those slots until
    /// they are reclaimed.
    fn tx_batch(&mut self, queue: u16, bufs: &mut VecDeque<PktBufSlot>) -> usize;

    /// Slots whose transmission completed, handed back for reuse.
    fn tx_reclaim(&mut self, queue: u16) -> Vec<Box<[u8]>>;

    /// Receive interrupt the engine waits on, if the driver has one.
    fn recv_irq(&self) -> Option<&EventFd> {
        None
    }

    fn check_recv_irq(&mut self, _queue: u16) -> bool {
        true
    }

    fn ack_recv_irq(&mut self, _queue: u16) {}
}

/// One TX frame received from the NIC.
pub struct UplinkRequest {
    slot: PktBufSlot,
}

impl UplinkRequest {
    fn frame(&self) -> &[u8] {
        &self.slot.data[..self.slot.len]
    }

    pub fn frame_prefix(&self) -> &[u8] {
        let f = self.frame();
        &f[..f.len().min(crate::request::FRAME_PREFIX_LEN)]
    }

    pub fn dst_mac(&self) -> MacAddr {
        match self.frame().get(..6) {
            Some(b) => MacAddr::from_bytes(b.try_into().unwrap()),
            None => MacAddr::UNKNOWN,
        }
    }

    pub fn src_mac(&self) -> MacAddr {
        match self.frame().get(6..12) {
            Some(b) => MacAddr::from_bytes(b.try_into().unwrap()),
            None => MacAddr::UNKNOWN,
        }
    }

    pub fn has_vlan(&self) -> bool {
        let f = self.frame();
        f.len() >= 14 && f[12] == 0x81 && f[13] == 0x00
    }

    pub fn vlan_id(&self) -> u16 {
        let f = self.frame();
        if !self.has_vlan() || f.len() < 16 {
            return VLAN_ID_NATIVE;
        }
        (u16::from(f[14]) << 8 | u16::from(f[15])) & 0xfff
    }

    pub fn transfer(&self) -> SourceTransfer<'_> {
        SourceTransfer::Host(HostTransfer::new(self.frame()))
    }
}

/// A switch port backed by a NIC.
pub struct UplinkPort {
    name: String,
    role: PortRole,
    mac: MacAddr,
    dev: Box<dyn NicDriver>,
    mempool: Mempool,
    rx_pending: VecDeque<PktBufSlot>,
    reschedule_fd: EventFd,
}

impl UplinkPort {
    pub fn new(dev: Box<dyn NicDriver>) -> std::io::Result<Self> {
        let name = dev.driver_name().to_string();
        let mac = dev.mac();
        Ok(UplinkPort {
            name,
            role: PortRole::Native,
            mac,
            dev,
            mempool: Mempool::new(NUM_BUFS, BUF_SIZE),
            rx_pending: VecDeque::new(),
            reschedule_fd: EventFd::new(0)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &PortRole {
        &self.role
    }

    pub fn set_role(&mut self, role: PortRole) {
        self.role = role;
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn driver(&mut self) -> &mut dyn NicDriver {
        self.dev.as_mut()
    }

    pub fn recv_irq(&self) -> Option<&EventFd> {
        self.dev.recv_irq()
    }

    pub fn reschedule_fd(&self) -> &EventFd {
        &self.reschedule_fd
    }

    pub fn reschedule_pending_tx(&self) {
        let _ = self.reschedule_fd.write(1);
    }

    fn fetch_tx_requests(&mut self) {
        if !self.rx_pending.is_empty() {
            return;
        }
        self.dev.rx_batch(0, &mut self.rx_pending, TX_BATCH_SIZE);
    }

    pub fn tx_work_pending(&mut self) -> bool {
        self.fetch_tx_requests();
        !self.rx_pending.is_empty()
    }

    pub fn take_next_tx(&mut self) -> Option<UplinkRequest> {
        self.fetch_tx_requests();
        self.rx_pending.pop_front().map(|slot| UplinkRequest { slot })
    }

    /// Copy one frame into a mempool slot and queue it on the NIC.
    ///
    /// Frames that do not fit one slot are dropped whole. The slot is
    /// either owned by the NIC TX ring afterwards or back in the pool.
    pub fn deliver(
        &mut self,
        src_kind: RoleKind,
        xfer: &mut SourceTransfer<'_>,
    ) -> Result<DeliverResult, BadDescriptor> {
        for slot in self.dev.tx_reclaim(0) {
            self.mempool.free(slot);
        }

        let Some(mut data) = self.mempool.alloc() else {
            trace!(target: "request", port = %self.name, "mempool exhausted, dropping");
            return Ok(DeliverResult::Dropped);
        };

        // The NIC gets raw frames; the source's virtio-net header is
        // not consulted (no offloads are negotiated across the wire).
        let mut mangle = self.role.mangle_from(src_kind);
        let mut sink = SlotSink::new(&mut data);
        let end = loop {
            match xfer.done() {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(Some(e)),
            }
            if sink.space() == 0 {
                trace!(target: "request", port = %self.name,
                       "frame exceeds slot size, dropping");
                break Err(None);
            }
            match xfer.copy_step(&mut mangle, &mut sink) {
                Ok(_) => {}
                Err(CopyFault::Source(e)) => break Err(Some(e)),
                // A slot sink cannot fault on its own memory.
                Err(CopyFault::Dest(_)) => break Err(None),
            }
        };

        let len = sink.written();
        match end {
            Ok(()) => {
                let mut out = VecDeque::from([PktBufSlot { data, len }]);
                if self.dev.tx_batch(0, &mut out) == 1 {
                    Ok(DeliverResult::Delivered)
                } else {
                    let slot = out.pop_front().expect("rejected slot");
                    self.mempool.free(slot.data);
                    Ok(DeliverResult::Dropped)
                }
            }
            Err(None) => {
                self.mempool.free(data);
                Ok(DeliverResult::Dropped)
            }
            Err(Some(e)) => {
                self.mempool.free(data);
                Err(e)
            }
        }
    }
}
