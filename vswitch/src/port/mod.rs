//! Switch ports: guest-facing virtio ports and the NIC uplink.

use vmm_sys_util::eventfd::EventFd;

use crate::mac_addr::MacAddr;
use crate::request::{NetRequest, SourceTransfer};
use crate::virtio::BadDescriptor;
use crate::vlan::{PortRole, RoleKind};

pub mod uplink;
pub mod virtio;

pub use uplink::{Mempool, NicDriver, PktBufSlot, UplinkPort, UplinkRequest};
pub use virtio::VirtioPort;

/// Outcome of delivering one frame to a destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverResult {
    Delivered,
    Dropped,
    /// The destination device was latched faulty inside the call; its
    /// queues must not be touched again this dispatch.
    Exception,
}

/// One TX request, from either port flavor.
pub enum PortRequest {
    Virtio(NetRequest),
    Uplink(UplinkRequest),
}

impl PortRequest {
    pub fn src_mac(&self) -> MacAddr {
        match self {
            PortRequest::Virtio(r) => r.src_mac(),
            PortRequest::Uplink(r) => r.src_mac(),
        }
    }

    pub fn dst_mac(&self) -> MacAddr {
        match self {
            PortRequest::Virtio(r) => r.dst_mac(),
            PortRequest::Uplink(r) => r.dst_mac(),
        }
    }

    pub fn has_vlan(&self) -> bool {
        match self {
            PortRequest::Virtio(r) => r.has_vlan(),
            PortRequest::Uplink(r) => r.has_vlan(),
        }
    }

    pub fn vlan_id(&self) -> u16 {
        match self {
            PortRequest::Virtio(r) => r.vlan_id(),
            PortRequest::Uplink(r) => r.vlan_id(),
        }
    }

    pub fn frame_prefix(&self) -> &[u8] {
        match self {
            PortRequest::Virtio(r) => r.frame_prefix(),
            PortRequest::Uplink(r) => r.frame_prefix(),
        }
    }

    /// Fresh per-destination source stream.
    pub fn transfer(&self) -> SourceTransfer<'_> {
        match self {
            PortRequest::Virtio(r) => SourceTransfer::Guest(r.transfer()),
            PortRequest::Uplink(r) => r.transfer(),
        }
    }
}

/// A port slot in the switch, over both backing flavors.
pub enum SwitchPort {
    Virtio(VirtioPort),
    Uplink(UplinkPort),
}

impl SwitchPort {
    pub fn name(&self) -> &str {
        match self {
            SwitchPort::Virtio(p) => p.name(),
            SwitchPort::Uplink(p) => p.name(),
        }
    }

    pub fn mac(&self) -> MacAddr {
        match self {
            SwitchPort::Virtio(p) => p.mac(),
            SwitchPort::Uplink(p) => p.mac(),
        }
    }

    pub fn role(&self) -> &PortRole {
        match self {
            SwitchPort::Virtio(p) => p.role(),
            SwitchPort::Uplink(p) => p.role(),
        }
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role().kind()
    }

    pub fn is_gone(&self) -> bool {
        match self {
            SwitchPort::Virtio(p) => p.is_gone(),
            // The uplink has no peer capability to lose.
            SwitchPort::Uplink(_) => false,
        }
    }

    pub fn reschedule_fd(&self) -> &EventFd {
        match self {
            SwitchPort::Virtio(p) => p.reschedule_fd(),
            SwitchPort::Uplink(p) => p.reschedule_fd(),
        }
    }

    pub fn reschedule_pending_tx(&self) {
        match self {
            SwitchPort::Virtio(p) => p.reschedule_pending_tx(),
            SwitchPort::Uplink(p) => p.reschedule_pending_tx(),
        }
    }

    pub fn tx_work_pending(&mut self) -> bool {
        match self {
            SwitchPort::Virtio(p) => p.tx_work_pending(),
            SwitchPort::Uplink(p) => p.tx_work_pending(),
        }
    }

    pub fn take_next_tx(&mut self) -> Result<Option<PortRequest>, BadDescriptor> {
        match self {
            SwitchPort::Virtio(p) => Ok(p.take_next_tx()?.map(PortRequest::Virtio)),
            SwitchPort::Uplink(p) => Ok(p.take_next_tx().map(PortRequest::Uplink)),
        }
    }

    /// Complete a routed request towards the source driver.
    pub fn complete_tx(&mut self, req: PortRequest) {
        match (self, req) {
            (SwitchPort::Virtio(p), PortRequest::Virtio(r)) => p.complete_tx(r.head()),
            // Uplink receive slots are recycled when the request drops.
            (SwitchPort::Uplink(_), PortRequest::Uplink(_)) => {}
            _ => unreachable!("request returned to a different port"),
        }
    }

    pub fn deliver(
        &mut self,
        src_kind: RoleKind,
        xfer: &mut SourceTransfer<'_>,
    ) -> Result<DeliverResult, BadDescriptor> {
        match self {
            SwitchPort::Virtio(p) => p.deliver(src_kind, xfer),
            SwitchPort::Uplink(p) => p.deliver(src_kind, xfer),
        }
    }

    /// Latch the port's device faulty after a source-side violation.
    pub fn device_error(&mut self) {
        match self {
            SwitchPort::Virtio(p) => p.dev_mut().device_error(),
            // NIC frames cannot fault; nothing to latch.
            SwitchPort::Uplink(_) => {}
        }
    }

    pub fn rx_notify_disable_and_remember(&mut self) {
        match self {
            SwitchPort::Virtio(p) => p.rx_notify_disable_and_remember(),
            SwitchPort::Uplink(_) => {}
        }
    }

    pub fn rx_notify_emit_and_enable(&mut self) {
        match self {
            SwitchPort::Virtio(p) => p.rx_notify_emit_and_enable(),
            SwitchPort::Uplink(_) => {}
        }
    }

    /// Tell the driver side to stop/resume kicking us while draining.
    pub fn tx_notify_disable(&mut self) {
        if let SwitchPort::Virtio(p) = self {
            let (mem, tx) = p.dev().tx_ref();
            tx.disable_notify(mem);
        }
    }

    pub fn tx_notify_enable(&mut self) {
        if let SwitchPort::Virtio(p) = self {
            let (mem, tx) = p.dev().tx_ref();
            tx.enable_notify(mem);
        }
    }

    pub fn rx_ring_notify_disable(&mut self) {
        if let SwitchPort::Virtio(p) = self {
            let (mem, rx) = p.dev().rx_ref();
            rx.disable_notify(mem);
        }
    }

    pub fn rx_ring_notify_enable(&mut self) {
        if let SwitchPort::Virtio(p) = self {
            let (mem, rx) = p.dev().rx_ref();
            rx.enable_notify(mem);
        }
    }
}
