//! Source-side view of one TX frame and its per-destination transfers.

use vm_memory::GuestMemoryMmap;

use crate::mac_addr::MacAddr;
use crate::virtio::{
    BadDescriptor, CopyFault, DescWalker, FrameSink, GuestSource, HostSource, PktBuf,
    VIRTIO_NET_HDR_SIZE, VirtioNetHdr,
};
use crate::vlan::{VLAN_ID_NATIVE, VlanMangle};

/// How much of the frame head is captured for switching decisions and
/// the mirror filter. MACs, tag and ethertype need 18 bytes; the rest
/// is slack for filters that look a little deeper.
pub const FRAME_PREFIX_LEN: usize = 64;

/// One TX request popped from a source port.
///
/// Parsing copies the virtio-net header and a bounded prefix of the
/// frame out of guest memory once, so switching decisions never touch
/// the (guest-mutable) chain again. The chain itself is re-read by
/// each destination's [`Transfer`].
pub struct NetRequest {
    head: u16,
    hdr: VirtioNetHdr,
    mem: GuestMemoryMmap,
    walker: DescWalker,
    first: PktBuf,
    prefix: [u8; FRAME_PREFIX_LEN],
    prefix_len: usize,
}

impl NetRequest {
    /// Parse the chain at `head`.
    ///
    /// `Ok(None)` means the chain is well-formed but not a usable net
    /// request (e.g. too short for the header); the caller completes
    /// it with a zero-length used entry.
    pub fn parse(
        mem: GuestMemoryMmap,
        mut walker: DescWalker,
        head: u16,
    ) -> Result<Option<NetRequest>, BadDescriptor> {
        let mut first = walker.start(&mem, head)?;

        let mut hdr_bytes = [0u8; VIRTIO_NET_HDR_SIZE];
        if first.read_into(&mem, &mut hdr_bytes)? != VIRTIO_NET_HDR_SIZE {
            return Ok(None);
        }
        let mut hdr = VirtioNetHdr::default();
        vm_memory::ByteValued::as_mut_slice(&mut hdr).copy_from_slice(&hdr_bytes);

        // The packet may start in a chained buffer.
        while first.done() {
            match walker.next_buf(&mem)? {
                Some(b) => first = b,
                None => return Ok(None),
            }
        }

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        let mut probe = first;
        let prefix_len = probe.read_into(&mem, &mut prefix)?;

        Ok(Some(NetRequest {
            head,
            hdr,
            mem,
            walker,
            first,
            prefix,
            prefix_len,
        }))
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn header(&self) -> &VirtioNetHdr {
        &self.hdr
    }

    /// The captured head of the frame, for the mirror filter.
    pub fn frame_prefix(&self) -> &[u8] {
        &self.prefix[..self.prefix_len]
    }

    pub fn dst_mac(&self) -> MacAddr {
        if self.prefix_len >= MacAddr::LENGTH {
            MacAddr::from_bytes(self.prefix[..6].try_into().unwrap())
        } else {
            MacAddr::UNKNOWN
        }
    }

    pub fn src_mac(&self) -> MacAddr {
        if self.prefix_len >= 2 * MacAddr::LENGTH {
            MacAddr::from_bytes(self.prefix[6..12].try_into().unwrap())
        } else {
            MacAddr::UNKNOWN
        }
    }

    pub fn has_vlan(&self) -> bool {
        self.prefix_len >= 14 && self.prefix[12] == 0x81 && self.prefix[13] == 0x00
    }

    /// The frame's VLAN id, or [`VLAN_ID_NATIVE`] when untagged.
    pub fn vlan_id(&self) -> u16 {
        if !self.has_vlan() || self.prefix_len < 16 {
            return VLAN_ID_NATIVE;
        }
        (u16::from(self.prefix[14]) << 8 | u16::from(self.prefix[15])) & 0xfff
    }

    /// A fresh per-destination copy cursor over the source chain.
    ///
    /// Each transfer snapshots the walker, so multiple destinations of
    /// a flooded frame read the chain independently.
    pub fn transfer(&self) -> Transfer {
        Transfer {
            hdr: self.hdr,
            mem: self.mem.clone(),
            walker: self.walker.clone(),
            cur: self.first,
        }
    }
}

/// Per-destination copy state of one [`NetRequest`].
pub struct Transfer {
    hdr: VirtioNetHdr,
    mem: GuestMemoryMmap,
    walker: DescWalker,
    cur: PktBuf,
}

impl Transfer {
    /// Populate a destination's virtio-net header.
    pub fn copy_header(&self) -> VirtioNetHdr {
        self.hdr
    }

    /// Whether all payload bytes were consumed; replenishes the
    /// cursor from the chain as needed.
    ///
    /// Errors indicate a malformed *source* chain.
    pub fn done(&mut self) -> Result<bool, BadDescriptor> {
        while self.cur.done() {
            match self.walker.next_buf(&self.mem)? {
                Some(b) => self.cur = b,
                None => return Ok(true),
            }
        }
        Ok(false)
    }

    /// Move one piece of payload through the mangler into `sink`.
    pub fn copy_step(
        &mut self,
        mangle: &mut VlanMangle,
        sink: &mut dyn FrameSink,
    ) -> Result<u32, CopyFault> {
        let mut src = GuestSource::new(&self.mem, &mut self.cur);
        mangle.copy_pkt(&mut src, sink)
    }
}

/// Transfer over a host-memory frame (uplink receive slot).
///
/// The virtio-net header is synthesized: a NIC frame carries no
/// offload state, so all flags are clear.
pub struct HostTransfer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> HostTransfer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        HostTransfer { data, pos: 0 }
    }
}

/// One per-destination source stream, from either port flavor.
pub enum SourceTransfer<'a> {
    Guest(Transfer),
    Host(HostTransfer<'a>),
}

impl SourceTransfer<'_> {
    /// The header to copy into the destination view.
    pub fn copy_header(&self) -> VirtioNetHdr {
        match self {
            SourceTransfer::Guest(t) => t.copy_header(),
            SourceTransfer::Host(_) => VirtioNetHdr {
                hdr_len: (VIRTIO_NET_HDR_SIZE as u16).into(),
                num_buffers: 1u16.into(),
                ..Default::default()
            },
        }
    }

    /// Errors indicate a malformed source chain (guest sources only).
    pub fn done(&mut self) -> Result<bool, BadDescriptor> {
        match self {
            SourceTransfer::Guest(t) => t.done(),
            SourceTransfer::Host(t) => Ok(t.pos == t.data.len()),
        }
    }

    pub fn copy_step(
        &mut self,
        mangle: &mut VlanMangle,
        sink: &mut dyn FrameSink,
    ) -> Result<u32, CopyFault> {
        match self {
            SourceTransfer::Guest(t) => t.copy_step(mangle, sink),
            SourceTransfer::Host(t) => {
                let mut src = HostSource::new(t.data, &mut t.pos);
                mangle.copy_pkt(&mut src, sink)
            }
        }
    }
}
