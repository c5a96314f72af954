//! Virtio-net device model: queues, descriptor chains, device state.

use vm_memory::{ByteValued, Le16};

pub mod chain;
pub mod device;
pub mod queue;

pub use chain::{
    CopyFault, DescWalker, FrameSink, FrameSource, GuestSink, GuestSource, HostSource, PktBuf,
    SlotSink,
};
pub use device::{DataspaceId, VirtioNetDev};
pub use queue::Virtqueue;

/// Queue indices of a net device.
pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;
pub const NUM_QUEUES: usize = 2;

/// Virtio-net feature bits (64-bit feature space).
pub const VIRTIO_NET_F_CSUM: u64 = 1 << 0;
pub const VIRTIO_NET_F_GUEST_CSUM: u64 = 1 << 1;
pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_GSO: u64 = 1 << 6;
pub const VIRTIO_NET_F_GUEST_TSO4: u64 = 1 << 7;
pub const VIRTIO_NET_F_GUEST_TSO6: u64 = 1 << 8;
pub const VIRTIO_NET_F_GUEST_ECN: u64 = 1 << 9;
pub const VIRTIO_NET_F_GUEST_UFO: u64 = 1 << 10;
pub const VIRTIO_NET_F_HOST_TSO4: u64 = 1 << 11;
pub const VIRTIO_NET_F_HOST_TSO6: u64 = 1 << 12;
pub const VIRTIO_NET_F_HOST_ECN: u64 = 1 << 13;
pub const VIRTIO_NET_F_HOST_UFO: u64 = 1 << 14;
pub const VIRTIO_NET_F_MRG_RXBUF: u64 = 1 << 15;
pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;
pub const VIRTIO_NET_F_CTRL_VQ: u64 = 1 << 17;
pub const VIRTIO_NET_F_CTRL_RX: u64 = 1 << 18;
pub const VIRTIO_NET_F_CTRL_VLAN: u64 = 1 << 19;

/// Transport feature bits.
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Device status byte.
pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;
pub const STATUS_FEATURES_OK: u8 = 8;
pub const STATUS_DEVICE_NEEDS_RESET: u8 = 0x40;
pub const STATUS_FAILED: u8 = 0x80;

/// Interrupt status register bits.
pub const ISR_VRING: u8 = 1;
pub const ISR_CONFIG: u8 = 2;

/// Virtio-net header flags.
pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;

/// Size of the header prepended to every frame on the wire format.
pub const VIRTIO_NET_HDR_SIZE: usize = 12;

/// Byte offset of `num_buffers` within [`VirtioNetHdr`].
pub const NUM_BUFFERS_OFFSET: usize = 10;

/// Virtio-net header, propagated verbatim between guests except for
/// `num_buffers` (rewritten per destination) and `csum_start`
/// (shifted when a VLAN tag is inserted or stripped).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: Le16,
    pub gso_size: Le16,
    pub csum_start: Le16,
    pub csum_offset: Le16,
    pub num_buffers: Le16,
}

// SAFETY: VirtioNetHdr contains only POD types
unsafe impl ByteValued for VirtioNetHdr {}

/// Protocol violation in a guest-supplied descriptor chain or ring.
///
/// The offending device gets latched `DEVICE_NEEDS_RESET`; the engine
/// never panics on guest-controlled data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BadDescriptor {
    #[error("descriptor index out of range")]
    IndexOutOfRange,
    #[error("descriptor chain exceeds ring size")]
    ChainTooLong,
    #[error("descriptor payload outside registered dataspaces")]
    AddressOutOfRange,
    #[error("descriptor table unreadable")]
    TableUnreadable,
    #[error("malformed indirect descriptor table")]
    BadIndirect,
    #[error("available ring unreadable")]
    RingUnreadable,
}
