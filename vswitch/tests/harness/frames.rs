//! Ethernet frame and virtio-net header builders for tests.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};

use vswitch::virtio::{VIRTIO_NET_HDR_F_NEEDS_CSUM, VirtioNetHdr};

pub fn mac(last: u8) -> [u8; 6] {
    [0x02, 0x00, 0x00, 0x00, 0x00, last]
}

pub const BROADCAST: [u8; 6] = [0xff; 6];

/// Build an untagged IPv4 Ethernet frame with a patterned payload.
pub fn ether_frame(dst: [u8; 6], src: [u8; 6], payload_len: usize) -> Vec<u8> {
    let repr = EthernetRepr {
        dst_addr: EthernetAddress(dst),
        src_addr: EthernetAddress(src),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut buf = vec![0u8; repr.buffer_len() + payload_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    repr.emit(&mut frame);
    for (i, b) in frame.payload_mut().iter_mut().enumerate() {
        *b = i as u8;
    }
    buf
}

/// Same, carrying an 802.1Q tag with the given VLAN id.
pub fn tagged_frame(dst: [u8; 6], src: [u8; 6], vid: u16, payload_len: usize) -> Vec<u8> {
    let mut buf = ether_frame(dst, src, payload_len);
    buf.splice(
        12..12,
        [0x81, 0x00, (vid >> 8) as u8, (vid & 0xff) as u8],
    );
    buf
}

pub fn plain_hdr() -> VirtioNetHdr {
    VirtioNetHdr::default()
}

/// A header asking the peer to finish a partial checksum.
pub fn csum_hdr(csum_start: u16, csum_offset: u16) -> VirtioNetHdr {
    VirtioNetHdr {
        flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
        csum_start: csum_start.into(),
        csum_offset: csum_offset.into(),
        ..Default::default()
    }
}
