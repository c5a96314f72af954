//! Virtio-net device state: features, status machine, config space,
//! dataspace registry and the driver-notification interrupt.

use std::sync::Arc;

use tracing::{debug, info, warn};
use vm_memory::mmap::GuestRegionMmap;
use vm_memory::{ByteValued, GuestAddress, GuestMemoryMmap, Le16};
use vmm_sys_util::eventfd::EventFd;

use crate::mac_addr::MacAddr;

use super::queue::{QueueConfigError, Virtqueue};
use super::{
    ISR_CONFIG, ISR_VRING, NUM_QUEUES, RX_QUEUE, STATUS_DEVICE_NEEDS_RESET, STATUS_DRIVER_OK,
    STATUS_FAILED, STATUS_FEATURES_OK, TX_QUEUE, VIRTIO_F_RING_INDIRECT_DESC, VIRTIO_F_VERSION_1,
    VIRTIO_NET_F_MAC, VIRTIO_NET_F_MRG_RXBUF,
};

/// VIRTIO_NET_S_LINK_UP
const NET_STATUS_LINK_UP: u16 = 1;

/// Identity of a dataspace's backing file, for the trusted check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataspaceId {
    pub dev: u64,
    pub ino: u64,
}

/// Virtio-net config space.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct NetConfigSpace {
    mac: [u8; 6],
    status: Le16,
    max_virtqueue_pairs: Le16,
}

// SAFETY: NetConfigSpace contains only POD types
unsafe impl ByteValued for NetConfigSpace {}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("dataspace limit reached")]
    TooManyDataspaces,
    #[error("dataspace is not in the trusted set")]
    UntrustedDataspace,
    #[error("dataspace overlaps a registered region")]
    RegionOverlap,
    #[error("no such queue")]
    BadQueueIndex,
    #[error(transparent)]
    QueueConfig(#[from] QueueConfigError),
}

/// One guest-facing virtio-net device.
pub struct VirtioNetDev {
    /// All dataspaces the client registered, as one address space.
    mem: GuestMemoryMmap,
    ds_count: usize,
    ds_max: usize,
    /// When set, only these backing files may be registered.
    trusted: Option<Vec<DataspaceId>>,

    host_features: u64,
    driver_features: u64,
    negotiated: u64,
    status: u8,
    isr: u8,
    config: NetConfigSpace,

    queues: [Virtqueue; NUM_QUEUES],
    vq_max: u16,

    /// Interrupt towards the guest driver, registered by the client.
    call_fd: Option<EventFd>,
}

impl VirtioNetDev {
    pub fn new(vq_max: u16, ds_max: usize, mac: Option<MacAddr>) -> Self {
        let mut host_features =
            VIRTIO_NET_F_MRG_RXBUF | VIRTIO_F_RING_INDIRECT_DESC | VIRTIO_F_VERSION_1;
        let mut config = NetConfigSpace {
            status: NET_STATUS_LINK_UP.into(),
            max_virtqueue_pairs: 1u16.into(),
            ..Default::default()
        };
        if let Some(mac) = mac {
            host_features |= VIRTIO_NET_F_MAC;
            config.mac = mac.to_bytes();
        }

        VirtioNetDev {
            mem: GuestMemoryMmap::new(),
            ds_count: 0,
            ds_max,
            trusted: None,
            host_features,
            driver_features: 0,
            negotiated: 0,
            status: 0,
            isr: 0,
            config,
            queues: [Virtqueue::new(), Virtqueue::new()],
            vq_max,
            call_fd: None,
        }
    }

    /// Restrict dataspace registration to the given backing files.
    pub fn set_trusted_dataspaces(&mut self, ids: Vec<DataspaceId>) {
        self.trusted = Some(ids);
    }

    pub fn dataspace_trusted(&self, id: DataspaceId) -> bool {
        match &self.trusted {
            Some(ids) => ids.contains(&id),
            None => true,
        }
    }

    /// Register one client dataspace as a guest-visible region.
    pub fn add_region(&mut self, region: GuestRegionMmap) -> Result<(), DeviceError> {
        if self.ds_count >= self.ds_max {
            return Err(DeviceError::TooManyDataspaces);
        }
        self.mem = self
            .mem
            .insert_region(Arc::new(region))
            .map_err(|_| DeviceError::RegionOverlap)?;
        self.ds_count += 1;
        Ok(())
    }

    pub fn host_features(&self) -> u64 {
        self.host_features
    }

    pub fn set_driver_features(&mut self, features: u64) {
        self.driver_features = features;
    }

    pub fn negotiated_features(&self) -> u64 {
        self.negotiated
    }

    pub fn mrg_rxbuf(&self) -> bool {
        self.negotiated & VIRTIO_NET_F_MRG_RXBUF != 0
    }

    pub fn indirect_desc(&self) -> bool {
        self.negotiated & VIRTIO_F_RING_INDIRECT_DESC != 0
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Drive the device status machine from a driver write.
    pub fn set_status(&mut self, val: u8) {
        if val == 0 {
            info!(target: "virtio", "driver reset");
            self.reset();
            return;
        }

        let mut val = val | (self.status & (STATUS_DEVICE_NEEDS_RESET | STATUS_FAILED));

        if val & STATUS_FEATURES_OK != 0 && self.status & STATUS_FEATURES_OK == 0 {
            if self.check_features() {
                self.negotiated = self.driver_features;
                debug!(target: "virtio", features = format_args!("{:#x}", self.negotiated),
                       "features negotiated");
            } else {
                warn!(target: "virtio",
                      offered = format_args!("{:#x}", self.host_features),
                      requested = format_args!("{:#x}", self.driver_features),
                      "rejecting driver feature selection");
                val &= !STATUS_FEATURES_OK;
            }
        }

        if val & STATUS_DRIVER_OK != 0 && self.status & STATUS_DRIVER_OK == 0 {
            if !self.queues.iter().all(|q| q.ready()) {
                warn!(target: "virtio", "DRIVER_OK with unconfigured queues");
                self.reset();
                self.status = STATUS_FAILED;
                return;
            }
            info!(target: "virtio", features = format_args!("{:#x}", self.negotiated),
                  "device live");
        }

        self.status = val;
    }

    fn check_features(&self) -> bool {
        self.driver_features & !self.host_features == 0
            && self.driver_features & VIRTIO_F_VERSION_1 != 0
    }

    /// Full device reset: negotiated state and queues go away, the
    /// registered dataspaces stay.
    pub fn reset(&mut self) {
        for q in &mut self.queues {
            q.disable();
        }
        self.driver_features = 0;
        self.negotiated = 0;
        self.status = 0;
        self.isr = 0;
    }

    /// Whether the device is processing traffic.
    pub fn live(&self) -> bool {
        self.status & STATUS_DRIVER_OK != 0 && !self.needs_reset()
    }

    pub fn needs_reset(&self) -> bool {
        self.status & STATUS_DEVICE_NEEDS_RESET != 0
    }

    /// Latch the device faulty after a guest protocol violation.
    ///
    /// One configuration-change interrupt is emitted; afterwards the
    /// engine stops touching the device's queues until the driver
    /// resets it.
    pub fn device_error(&mut self) {
        if self.needs_reset() {
            return;
        }
        warn!(target: "virtio", "guest protocol violation, latching NEEDS_RESET");
        self.status |= STATUS_DEVICE_NEEDS_RESET;
        self.isr |= ISR_CONFIG;
        self.trigger_call();
    }

    pub fn read_config(&self, offset: u32, len: u32) -> Vec<u8> {
        let bytes = self.config.as_slice();
        let start = (offset as usize).min(bytes.len());
        let end = (start + len as usize).min(bytes.len());
        bytes[start..end].to_vec()
    }

    pub fn write_config(&mut self, offset: u32, _data: &[u8]) {
        // The net config space is read-only for the driver.
        warn!(target: "virtio", offset, "ignoring write to read-only config space");
    }

    pub fn setup_queue(
        &mut self,
        index: u16,
        size: u16,
        desc_table: GuestAddress,
        avail_ring: GuestAddress,
        used_ring: GuestAddress,
    ) -> Result<(), DeviceError> {
        let q = self
            .queues
            .get_mut(index as usize)
            .ok_or(DeviceError::BadQueueIndex)?;
        q.configure(&self.mem, size, self.vq_max, desc_table, avail_ring, used_ring)?;
        debug!(target: "virtio", index, size, "queue configured");
        Ok(())
    }

    pub fn vq_max(&self) -> u16 {
        self.vq_max
    }

    pub fn mac(&self) -> MacAddr {
        if self.host_features & VIRTIO_NET_F_MAC != 0 {
            MacAddr::from_bytes(&self.config.mac)
        } else {
            MacAddr::UNKNOWN
        }
    }

    pub fn mem(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Cheap handle for request/transfer values that outlive a borrow
    /// of the device.
    pub fn mem_handle(&self) -> GuestMemoryMmap {
        self.mem.clone()
    }

    /// Split access: the RX queue plus the memory it lives in.
    pub fn rx(&mut self) -> (&GuestMemoryMmap, &mut Virtqueue) {
        (&self.mem, &mut self.queues[RX_QUEUE as usize])
    }

    pub fn tx(&mut self) -> (&GuestMemoryMmap, &mut Virtqueue) {
        (&self.mem, &mut self.queues[TX_QUEUE as usize])
    }

    pub fn rx_ref(&self) -> (&GuestMemoryMmap, &Virtqueue) {
        (&self.mem, &self.queues[RX_QUEUE as usize])
    }

    pub fn tx_ref(&self) -> (&GuestMemoryMmap, &Virtqueue) {
        (&self.mem, &self.queues[TX_QUEUE as usize])
    }

    pub fn set_call_fd(&mut self, fd: EventFd) {
        self.call_fd = Some(fd);
    }

    /// Read-and-clear the interrupt status register.
    pub fn take_isr(&mut self) -> u8 {
        std::mem::take(&mut self.isr)
    }

    fn trigger_call(&self) {
        if let Some(fd) = &self.call_fd
            && let Err(e) = fd.write(1)
        {
            warn!(target: "virtio", error = %e, "guest notify failed");
        }
    }

    /// Raise a used-ring interrupt towards the driver.
    pub fn irq_vring(&mut self) {
        self.isr |= ISR_VRING;
        self.trigger_call();
    }

    /// Suppress driver interrupts on both queues for a drain.
    pub fn kick_disable_and_remember(&mut self) {
        for q in &mut self.queues {
            q.kick_disable_and_remember();
        }
    }

    /// Re-enable driver interrupts, emitting one interrupt if any
    /// queue swallowed a kick while suppressed.
    pub fn kick_emit_and_enable(&mut self) {
        let mut pending = false;
        for q in &mut self.queues {
            pending |= q.kick_enable_get_pending();
        }
        if pending {
            self.irq_vring();
        }
    }
}
