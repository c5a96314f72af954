//! VLAN roles and 802.1Q tag rewriting.

use std::collections::BTreeSet;

use crate::virtio::{
    CopyFault, FrameSink, FrameSource, VIRTIO_NET_HDR_F_NEEDS_CSUM, VirtioNetHdr,
};

/// Pseudo tag carried by untagged traffic from ports outside any VLAN.
pub const VLAN_ID_NATIVE: u16 = 0xffff;
/// Pseudo tag for trunk ports themselves.
pub const VLAN_ID_TRUNK: u16 = 0xfffe;

/// User-assignable VLAN ids.
pub fn vlan_valid_id(id: u16) -> bool {
    id > 0 && id < 0xfff
}

/// VLAN ids switched on a trunk port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrunkSet {
    All,
    Ids(BTreeSet<u16>),
}

/// The VLAN personality of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRole {
    /// Untagged, outside any VLAN.
    Native,
    /// Belongs to exactly one VLAN; never sees tags.
    Access(u16),
    /// Carries tagged traffic for a set of VLANs.
    Trunk(TrunkSet),
    /// Mirror destination; never matched by flooding.
    Monitor,
}

/// Copyable summary of a source port's role, taken before the
/// destination port is borrowed for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Native,
    Access(u16),
    Trunk,
}

impl RoleKind {
    pub fn is_trunk(self) -> bool {
        matches!(self, RoleKind::Trunk)
    }

    pub fn is_native(self) -> bool {
        matches!(self, RoleKind::Native)
    }

    pub fn is_access(self) -> bool {
        matches!(self, RoleKind::Access(_))
    }
}

impl PortRole {
    pub fn is_trunk(&self) -> bool {
        matches!(self, PortRole::Trunk(_) | PortRole::Monitor)
    }

    pub fn is_native(&self) -> bool {
        matches!(self, PortRole::Native)
    }

    pub fn is_access(&self) -> bool {
        matches!(self, PortRole::Access(_))
    }

    pub fn kind(&self) -> RoleKind {
        match self {
            PortRole::Native => RoleKind::Native,
            PortRole::Access(vid) => RoleKind::Access(*vid),
            PortRole::Trunk(_) | PortRole::Monitor => RoleKind::Trunk,
        }
    }

    /// The tag this port stamps on untagged ingress traffic.
    pub fn port_vlan(&self) -> u16 {
        match self {
            PortRole::Native => VLAN_ID_NATIVE,
            PortRole::Access(vid) => *vid,
            PortRole::Trunk(_) | PortRole::Monitor => VLAN_ID_TRUNK,
        }
    }

    /// Whether traffic carrying `tag` is switched onto this port.
    ///
    /// Untagged traffic carries [`VLAN_ID_NATIVE`]; a trunk-all port
    /// accepts even that.
    pub fn match_vlan(&self, tag: u16) -> bool {
        match self {
            PortRole::Native => tag == VLAN_ID_NATIVE,
            PortRole::Access(vid) => tag == *vid,
            PortRole::Trunk(TrunkSet::All) => true,
            PortRole::Trunk(TrunkSet::Ids(ids)) => ids.contains(&tag),
            PortRole::Monitor => false,
        }
    }

    /// Build the tag rewrite for a frame travelling `src` -> `self`.
    ///
    /// Tagged egress is required on trunk and monitor ports, so frames
    /// from access ports get their access VLAN inserted and frames
    /// from native ports a priority tag (TCI 0). Access and native
    /// egress strips the tag a trunk source carried.
    pub fn mangle_from(&self, src: RoleKind) -> VlanMangle {
        if self.is_trunk() {
            match src {
                RoleKind::Access(vid) => VlanMangle::insert(vid),
                RoleKind::Native => VlanMangle::insert(0),
                RoleKind::Trunk => VlanMangle::passthrough(),
            }
        } else if src.is_trunk() {
            VlanMangle::strip()
        } else {
            VlanMangle::passthrough()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Passthrough,
    Insert,
    Strip,
}

/// Streaming 802.1Q tag rewriter.
///
/// Fed the frame bytes in arbitrarily small pieces, it copies the two
/// MAC addresses through, then inserts or removes the 4-byte tag, then
/// passes the rest through. One instance is built per (source,
/// destination) pair and must not be reused across frames.
#[derive(Debug)]
pub struct VlanMangle {
    mode: Mode,
    tci: u16,
    mac_remaining: u32,
    tag_remaining: i8,
}

impl VlanMangle {
    pub fn passthrough() -> Self {
        VlanMangle {
            mode: Mode::Passthrough,
            tci: 0,
            mac_remaining: 0,
            tag_remaining: 0,
        }
    }

    /// Insert a tag with the given TCI after the MAC addresses.
    ///
    /// The caller must ensure the frame is not already tagged.
    pub fn insert(tci: u16) -> Self {
        VlanMangle {
            mode: Mode::Insert,
            tci,
            mac_remaining: 12,
            tag_remaining: 4,
        }
    }

    /// Remove the tag the frame is assumed to carry.
    pub fn strip() -> Self {
        VlanMangle {
            mode: Mode::Strip,
            tci: 0,
            mac_remaining: 12,
            tag_remaining: -4,
        }
    }

    /// Copy a piece of the frame from `src` into `sink`, rewriting the
    /// tag region in flight. Returns the number of bytes written to
    /// the sink; repeated calls make progress until the source buffer
    /// is drained.
    pub fn copy_pkt(
        &mut self,
        src: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
    ) -> Result<u32, CopyFault> {
        match self.mode {
            Mode::Passthrough => src.copy_into(sink, u32::MAX),
            _ if self.mac_remaining > 0 => {
                let n = src.copy_into(sink, self.mac_remaining)?;
                self.mac_remaining -= n;
                Ok(n)
            }
            _ if self.tag_remaining > 0 => {
                let tag = [0x81, 0x00, (self.tci >> 8) as u8, (self.tci & 0xff) as u8];
                let n = sink.put(&tag[4 - self.tag_remaining as usize..])?;
                self.tag_remaining -= n as i8;
                Ok(n)
            }
            _ if self.tag_remaining < 0 => {
                self.tag_remaining += src.skip((-self.tag_remaining) as u32) as i8;
                Ok(0)
            }
            _ => src.copy_into(sink, u32::MAX),
        }
    }

    /// Patch the virtio-net header for the tag delta.
    ///
    /// Called exactly once per frame, after the header was copied to
    /// the destination view but before any payload bytes move.
    pub fn rewrite_hdr(&self, hdr: &mut VirtioNetHdr) {
        if hdr.flags & VIRTIO_NET_HDR_F_NEEDS_CSUM == 0 {
            return;
        }
        let start = u16::from(hdr.csum_start);
        match self.mode {
            Mode::Insert => hdr.csum_start = start.wrapping_add(4).into(),
            Mode::Strip => hdr.csum_start = start.wrapping_sub(4).into(),
            Mode::Passthrough => {}
        }
    }
}
