//! Guest-facing switch port backed by a virtio-net device.

use tracing::{trace, warn};
use vm_memory::{Bytes, GuestAddress, Le16};
use vmm_sys_util::eventfd::EventFd;

use crate::mac_addr::MacAddr;
use crate::request::{NetRequest, SourceTransfer};
use crate::virtio::{
    BadDescriptor, CopyFault, DescWalker, GuestSink, NUM_BUFFERS_OFFSET, PktBuf,
    VIRTIO_NET_HDR_SIZE, VirtioNetDev,
};
use crate::vlan::{PortRole, RoleKind};

use super::DeliverResult;

/// How a delivery loop ended; the queue and device consequences are
/// applied after the loop so the borrows stay untangled.
enum CopyEnd {
    Complete,
    NoBuffer,
    DstFault,
    SrcFault(BadDescriptor),
}

pub struct VirtioPort {
    name: String,
    role: PortRole,
    dev: VirtioNetDev,
    /// Engine self-interrupt: re-enter TX handling after a burst.
    reschedule_fd: EventFd,
    gone: bool,
}

impl VirtioPort {
    pub fn new(
        name: String,
        role: PortRole,
        vq_max: u16,
        ds_max: usize,
        mac: Option<MacAddr>,
    ) -> std::io::Result<Self> {
        Ok(VirtioPort {
            name,
            role,
            dev: VirtioNetDev::new(vq_max, ds_max, mac),
            reschedule_fd: EventFd::new(0)?,
            gone: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &PortRole {
        &self.role
    }

    pub fn mac(&self) -> MacAddr {
        self.dev.mac()
    }

    pub fn dev(&self) -> &VirtioNetDev {
        &self.dev
    }

    pub fn dev_mut(&mut self) -> &mut VirtioNetDev {
        &mut self.dev
    }

    /// The peer dropped its end of the port.
    pub fn set_gone(&mut self) {
        self.gone = true;
    }

    pub fn is_gone(&self) -> bool {
        self.gone
    }

    pub fn reschedule_fd(&self) -> &EventFd {
        &self.reschedule_fd
    }

    /// Queue a deferred TX wake-up for this port.
    pub fn reschedule_pending_tx(&self) {
        if let Err(e) = self.reschedule_fd.write(1) {
            warn!(target: "port", port = %self.name, error = %e, "reschedule failed");
        }
    }

    /// Whether the transmission queue holds unconsumed heads.
    pub fn tx_work_pending(&self) -> bool {
        let (mem, tx) = self.dev.tx_ref();
        self.dev.live() && tx.desc_avail(mem)
    }

    /// Pop and parse one TX request.
    ///
    /// A chain too short to be a net request is completed immediately
    /// with a zero-length used entry and reported as no work; the
    /// dispatcher's outer loop picks up anything queued behind it.
    pub fn take_next_tx(&mut self) -> Result<Option<NetRequest>, BadDescriptor> {
        if !self.dev.live() {
            return Ok(None);
        }
        let indirect = self.dev.indirect_desc();
        let mem = self.dev.mem_handle();
        let (m, tx) = self.dev.tx();
        let Some(head) = tx.next_avail(m)? else {
            return Ok(None);
        };

        let walker = DescWalker::new(tx.desc_table(), tx.size(), indirect);
        match NetRequest::parse(mem, walker, head)? {
            Some(req) => Ok(Some(req)),
            None => {
                warn!(target: "queue", port = %self.name, head, "invalid net request");
                let kick = tx.finish(m, head, 0)?;
                if kick {
                    self.dev.irq_vring();
                }
                Ok(None)
            }
        }
    }

    /// Publish the TX used entry for a routed request.
    ///
    /// Runs after every destination was attempted, so the source
    /// driver never observes completion before the copies finished.
    pub fn complete_tx(&mut self, head: u16) {
        let (m, tx) = self.dev.tx();
        if !tx.ready() {
            return;
        }
        match tx.finish(m, head, 0) {
            Ok(true) => self.dev.irq_vring(),
            Ok(false) => {}
            Err(_) => self.dev.device_error(),
        }
    }

    /// Monitor duty: consume and complete every pending TX head
    /// without copying anything anywhere.
    pub fn drop_requests(&mut self) {
        if !self.dev.live() {
            return;
        }
        let mut kick = false;
        loop {
            let (m, tx) = self.dev.tx();
            match tx.next_avail(m) {
                Ok(Some(head)) => match tx.finish(m, head, 0) {
                    Ok(k) => kick |= k,
                    Err(_) => {
                        self.dev.device_error();
                        return;
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    self.dev.device_error();
                    return;
                }
            }
        }
        if kick {
            self.dev.irq_vring();
        }
    }

    pub fn rx_notify_disable_and_remember(&mut self) {
        self.dev.kick_disable_and_remember();
    }

    pub fn rx_notify_emit_and_enable(&mut self) {
        self.dev.kick_emit_and_enable();
    }

    /// Copy one frame into this port's RX queue.
    ///
    /// Walks the destination chain, merging additional heads when
    /// `MRG_RXBUF` was negotiated, and publishes either one used entry
    /// or the whole merge batch. On any failure before publication the
    /// available-ring cursor is rewound, so the guest never sees a
    /// half-written completion.
    ///
    /// `Err` reports a fault in the *source* chain; the caller latches
    /// the source device. Destination faults are handled here and
    /// surface as [`DeliverResult::Exception`].
    pub fn deliver(
        &mut self,
        src_kind: RoleKind,
        xfer: &mut SourceTransfer<'_>,
    ) -> Result<DeliverResult, BadDescriptor> {
        if !self.dev.live() {
            return Ok(DeliverResult::Dropped);
        }
        let mut mangle = self.role.mangle_from(src_kind);
        let mrg_rxbuf = self.dev.mrg_rxbuf();
        let indirect = self.dev.indirect_desc();

        let (mem, rx) = self.dev.rx();
        if !rx.ready() {
            return Ok(DeliverResult::Dropped);
        }

        let mut walker = DescWalker::new(rx.desc_table(), rx.size(), indirect);
        let first_pos = rx.avail_pos();

        let mut consumed: Vec<(u16, u32)> = Vec::new();
        let mut total: u32 = 0;
        let mut num_merged: u16 = 0;
        let mut dst_head: Option<u16> = None;
        let mut dst_buf = PktBuf::empty();
        let mut hdr_addr: Option<GuestAddress> = None;

        let end = loop {
            match xfer.done() {
                Ok(true) => break CopyEnd::Complete,
                Ok(false) => {}
                Err(e) => break CopyEnd::SrcFault(e),
            }

            if dst_head.is_none() {
                let head = match rx.next_avail(mem) {
                    Ok(Some(h)) => h,
                    Ok(None) => {
                        trace!(target: "request", port = %self.name,
                               "destination queue depleted, dropping");
                        break CopyEnd::NoBuffer;
                    }
                    Err(_) => break CopyEnd::DstFault,
                };
                dst_buf = match walker.start(mem, head) {
                    Ok(b) => b,
                    Err(_) => break CopyEnd::DstFault,
                };
                dst_head = Some(head);
                num_merged += 1;

                if hdr_addr.is_none() {
                    // The destination header must be contiguous in the
                    // first buffer; its num_buffers slot is patched
                    // after the copy.
                    if (dst_buf.left() as usize) < VIRTIO_NET_HDR_SIZE {
                        trace!(target: "request", port = %self.name,
                               "first buffer too small for header, dropping");
                        break CopyEnd::NoBuffer;
                    }
                    let mut hdr = xfer.copy_header();
                    mangle.rewrite_hdr(&mut hdr);
                    hdr_addr = Some(dst_buf.addr());
                    match dst_buf.write_from(mem, vm_memory::ByteValued::as_slice(&hdr)) {
                        Ok(_) => total = VIRTIO_NET_HDR_SIZE as u32,
                        Err(_) => break CopyEnd::DstFault,
                    }
                }
            }

            if dst_buf.done() {
                // Current buffer full: follow the chain, then fall
                // back to merging in another head.
                match walker.next_buf(mem) {
                    Ok(Some(b)) => dst_buf = b,
                    Ok(None) => {
                        if mrg_rxbuf {
                            let head = dst_head.take().expect("merge without head");
                            consumed.push((head, total));
                            total = 0;
                        } else {
                            trace!(target: "request", port = %self.name,
                                   "destination buffer too small, dropping");
                            break CopyEnd::NoBuffer;
                        }
                    }
                    Err(_) => break CopyEnd::DstFault,
                }
            } else {
                let mut sink = GuestSink::new(mem, &mut dst_buf);
                match xfer.copy_step(&mut mangle, &mut sink) {
                    Ok(n) => total += n,
                    Err(CopyFault::Source(e)) => break CopyEnd::SrcFault(e),
                    Err(CopyFault::Dest(_)) => break CopyEnd::DstFault,
                }
            }
        };

        match end {
            CopyEnd::Complete => {
                let Some(hdr_addr) = hdr_addr else {
                    // Nothing was consumed for an empty frame.
                    return Ok(DeliverResult::Dropped);
                };
                let num_buffers_at =
                    GuestAddress(hdr_addr.0 + NUM_BUFFERS_OFFSET as u64);
                if mem
                    .write_obj(Le16::from(num_merged), num_buffers_at)
                    .is_err()
                {
                    self.dev.device_error();
                    return Ok(DeliverResult::Exception);
                }

                let finished = if consumed.is_empty() {
                    let head = dst_head.expect("completed without head");
                    rx.finish(mem, head, total)
                } else {
                    let head = dst_head.expect("completed without head");
                    consumed.push((head, total));
                    rx.finish_batch(mem, &consumed)
                };
                match finished {
                    Ok(kick) => {
                        if kick {
                            self.dev.irq_vring();
                        }
                        Ok(DeliverResult::Delivered)
                    }
                    Err(_) => {
                        self.dev.device_error();
                        Ok(DeliverResult::Exception)
                    }
                }
            }
            CopyEnd::NoBuffer => {
                rx.rewind_avail_to(first_pos);
                Ok(DeliverResult::Dropped)
            }
            CopyEnd::DstFault => {
                self.dev.device_error();
                Ok(DeliverResult::Exception)
            }
            CopyEnd::SrcFault(e) => {
                rx.rewind_avail_to(first_pos);
                Err(e)
            }
        }
    }
}
