//! Descriptor-chain walking and buffer cursors.
//!
//! Everything a guest hands us through a virtqueue is untrusted: every
//! link, index and payload range is validated against the registered
//! dataspaces before it is touched, and a hop budget bounds chain
//! length so a cycle cannot hang the engine.

use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use super::BadDescriptor;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

const DESC_SIZE: u64 = 16;

/// One split-ring descriptor as it sits in the table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Desc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

// SAFETY: Desc contains only POD types
unsafe impl ByteValued for Desc {}

/// Fault attribution for a copy between two guests.
///
/// The engine reacts differently depending on which side violated the
/// protocol: a source fault aborts the whole request, a destination
/// fault only poisons that destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFault {
    Source(BadDescriptor),
    Dest(BadDescriptor),
}

/// Cursor over one descriptor's payload in guest memory.
///
/// Carries no reference to the backing memory; all accessors take the
/// owning device's memory so the cursor stays a plain value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktBuf {
    addr: GuestAddress,
    left: u32,
}

impl PktBuf {
    pub fn empty() -> Self {
        PktBuf {
            addr: GuestAddress(0),
            left: 0,
        }
    }

    pub fn addr(&self) -> GuestAddress {
        self.addr
    }

    pub fn left(&self) -> u32 {
        self.left
    }

    pub fn done(&self) -> bool {
        self.left == 0
    }

    fn advance(&mut self, n: u32) {
        self.addr = GuestAddress(self.addr.0.wrapping_add(u64::from(n)));
        self.left -= n;
    }

    /// Advance by up to `n` bytes, returning how far the cursor moved.
    pub fn skip(&mut self, n: u32) -> u32 {
        let n = n.min(self.left);
        self.advance(n);
        n
    }

    /// Copy up to `out.len()` bytes into `out`, advancing the cursor.
    pub fn read_into(
        &mut self,
        mem: &GuestMemoryMmap,
        out: &mut [u8],
    ) -> Result<usize, BadDescriptor> {
        let n = (self.left as usize).min(out.len());
        mem.read_slice(&mut out[..n], self.addr)
            .map_err(|_| BadDescriptor::AddressOutOfRange)?;
        self.advance(n as u32);
        Ok(n)
    }

    /// Copy up to `data.len()` bytes from `data`, advancing the cursor.
    pub fn write_from(
        &mut self,
        mem: &GuestMemoryMmap,
        data: &[u8],
    ) -> Result<usize, BadDescriptor> {
        let n = (self.left as usize).min(data.len());
        mem.write_slice(&data[..n], self.addr)
            .map_err(|_| BadDescriptor::AddressOutOfRange)?;
        self.advance(n as u32);
        Ok(n)
    }
}

/// Origin of frame bytes being copied to a destination.
///
/// Implemented over a guest chain's current buffer and over
/// host-memory frames (uplink receive slots); the VLAN mangler pulls
/// through this seam.
pub trait FrameSource {
    /// Bytes left in the source's current buffer.
    fn left(&self) -> u32;

    /// Drop up to `n` source bytes (tag stripping).
    fn skip(&mut self, n: u32) -> u32;

    /// Move up to `max` bytes into `sink`.
    fn copy_into(&mut self, sink: &mut dyn FrameSink, max: u32) -> Result<u32, CopyFault>;
}

/// Source reading a guest chain's current buffer.
pub struct GuestSource<'a> {
    mem: &'a GuestMemoryMmap,
    buf: &'a mut PktBuf,
}

impl<'a> GuestSource<'a> {
    pub fn new(mem: &'a GuestMemoryMmap, buf: &'a mut PktBuf) -> Self {
        GuestSource { mem, buf }
    }
}

impl FrameSource for GuestSource<'_> {
    fn left(&self) -> u32 {
        self.buf.left
    }

    fn skip(&mut self, n: u32) -> u32 {
        self.buf.skip(n)
    }

    fn copy_into(&mut self, sink: &mut dyn FrameSink, max: u32) -> Result<u32, CopyFault> {
        sink.copy_from(self.mem, self.buf, max)
    }
}

/// Source reading a host-memory frame.
pub struct HostSource<'a> {
    data: &'a [u8],
    pos: &'a mut usize,
}

impl<'a> HostSource<'a> {
    pub fn new(data: &'a [u8], pos: &'a mut usize) -> Self {
        HostSource { data, pos }
    }
}

impl FrameSource for HostSource<'_> {
    fn left(&self) -> u32 {
        (self.data.len() - *self.pos) as u32
    }

    fn skip(&mut self, n: u32) -> u32 {
        let n = n.min(self.left());
        *self.pos += n as usize;
        n
    }

    fn copy_into(&mut self, sink: &mut dyn FrameSink, max: u32) -> Result<u32, CopyFault> {
        let n = max.min(self.left()) as usize;
        if n == 0 {
            return Ok(0);
        }
        let written = sink.put(&self.data[*self.pos..*self.pos + n])?;
        *self.pos += written as usize;
        Ok(written)
    }
}

/// Destination for frame bytes pulled out of a source.
///
/// Implemented for guest RX buffers and for host-memory slots (uplink
/// DMA buffers); the VLAN mangler copies through this seam.
pub trait FrameSink {
    /// Bytes the sink can still take in its current buffer.
    fn space(&self) -> u32;

    /// Move up to `max` bytes from `src` into the sink.
    fn copy_from(
        &mut self,
        src_mem: &GuestMemoryMmap,
        src: &mut PktBuf,
        max: u32,
    ) -> Result<u32, CopyFault>;

    /// Write literal bytes (tag insertion).
    fn put(&mut self, bytes: &[u8]) -> Result<u32, CopyFault>;
}

/// Sink writing into a destination guest's RX buffer.
pub struct GuestSink<'a> {
    mem: &'a GuestMemoryMmap,
    buf: &'a mut PktBuf,
}

impl<'a> GuestSink<'a> {
    pub fn new(mem: &'a GuestMemoryMmap, buf: &'a mut PktBuf) -> Self {
        GuestSink { mem, buf }
    }
}

impl FrameSink for GuestSink<'_> {
    fn space(&self) -> u32 {
        self.buf.left
    }

    fn copy_from(
        &mut self,
        src_mem: &GuestMemoryMmap,
        src: &mut PktBuf,
        max: u32,
    ) -> Result<u32, CopyFault> {
        let n = max.min(src.left).min(self.buf.left);
        if n == 0 {
            return Ok(0);
        }
        let s = src_mem
            .get_slice(src.addr, n as usize)
            .map_err(|_| CopyFault::Source(BadDescriptor::AddressOutOfRange))?;
        let d = self
            .mem
            .get_slice(self.buf.addr, n as usize)
            .map_err(|_| CopyFault::Dest(BadDescriptor::AddressOutOfRange))?;
        s.copy_to_volatile_slice(d);
        src.advance(n);
        self.buf.advance(n);
        Ok(n)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<u32, CopyFault> {
        self.buf
            .write_from(self.mem, bytes)
            .map(|n| n as u32)
            .map_err(CopyFault::Dest)
    }
}

/// Sink writing into a host-memory slot.
pub struct SlotSink<'a> {
    data: &'a mut [u8],
    pos: usize,
}

impl<'a> SlotSink<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        SlotSink { data, pos: 0 }
    }

    /// Total bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }
}

impl FrameSink for SlotSink<'_> {
    fn space(&self) -> u32 {
        (self.data.len() - self.pos) as u32
    }

    fn copy_from(
        &mut self,
        src_mem: &GuestMemoryMmap,
        src: &mut PktBuf,
        max: u32,
    ) -> Result<u32, CopyFault> {
        let n = (max.min(src.left) as usize).min(self.data.len() - self.pos);
        if n == 0 {
            return Ok(0);
        }
        let n = src
            .read_into(src_mem, &mut self.data[self.pos..self.pos + n])
            .map_err(CopyFault::Source)?;
        self.pos += n;
        Ok(n as u32)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<u32, CopyFault> {
        let n = bytes.len().min(self.data.len() - self.pos);
        self.data[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        self.pos += n;
        Ok(n as u32)
    }
}

/// Walks a descriptor chain, yielding one [`PktBuf`] per descriptor.
///
/// A plain `Clone` value: per-destination transfers snapshot the
/// walker so a broadcast reads the source chain once per destination
/// without contending over cursor state.
#[derive(Debug, Clone)]
pub struct DescWalker {
    table: GuestAddress,
    qsize: u16,
    allow_indirect: bool,
    next: Option<u16>,
    hops: u16,
    indirect: Option<IndirectTable>,
}

#[derive(Debug, Clone)]
struct IndirectTable {
    table: GuestAddress,
    count: u16,
    next: u16,
    hops: u16,
}

impl DescWalker {
    pub fn new(table: GuestAddress, qsize: u16, allow_indirect: bool) -> Self {
        DescWalker {
            table,
            qsize,
            allow_indirect,
            next: None,
            hops: 0,
            indirect: None,
        }
    }

    /// Begin walking at `head`, returning the first buffer.
    pub fn start(
        &mut self,
        mem: &GuestMemoryMmap,
        head: u16,
    ) -> Result<PktBuf, BadDescriptor> {
        self.next = Some(head);
        self.hops = self.qsize;
        self.indirect = None;
        self.next_buf(mem)?.ok_or(BadDescriptor::BadIndirect)
    }

    /// Follow the chain to the next buffer, if any.
    pub fn next_buf(
        &mut self,
        mem: &GuestMemoryMmap,
    ) -> Result<Option<PktBuf>, BadDescriptor> {
        loop {
            if let Some(ind) = &mut self.indirect {
                if ind.hops == 0 {
                    return Err(BadDescriptor::ChainTooLong);
                }
                ind.hops -= 1;
                let d = read_desc(mem, ind.table, ind.next, ind.count)?;
                if d.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                    // no nested indirection
                    return Err(BadDescriptor::BadIndirect);
                }
                if d.flags & VIRTQ_DESC_F_NEXT != 0 {
                    ind.next = d.next;
                } else {
                    self.indirect = None;
                }
                return Ok(Some(payload(mem, d)?));
            }

            let Some(idx) = self.next else {
                return Ok(None);
            };
            if self.hops == 0 {
                return Err(BadDescriptor::ChainTooLong);
            }
            self.hops -= 1;

            let d = read_desc(mem, self.table, idx, self.qsize)?;
            if d.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                if !self.allow_indirect
                    || d.flags & VIRTQ_DESC_F_NEXT != 0
                    || d.len == 0
                    || d.len % DESC_SIZE as u32 != 0
                    || u64::from(d.len) / DESC_SIZE > u64::from(u16::MAX)
                {
                    return Err(BadDescriptor::BadIndirect);
                }
                let count = (u64::from(d.len) / DESC_SIZE) as u16;
                self.indirect = Some(IndirectTable {
                    table: GuestAddress(d.addr),
                    count,
                    next: 0,
                    hops: count,
                });
                self.next = None;
                continue;
            }

            self.next = (d.flags & VIRTQ_DESC_F_NEXT != 0).then_some(d.next);
            return Ok(Some(payload(mem, d)?));
        }
    }
}

fn read_desc(
    mem: &GuestMemoryMmap,
    table: GuestAddress,
    idx: u16,
    limit: u16,
) -> Result<Desc, BadDescriptor> {
    if idx >= limit {
        return Err(BadDescriptor::IndexOutOfRange);
    }
    let addr = table
        .0
        .checked_add(u64::from(idx) * DESC_SIZE)
        .ok_or(BadDescriptor::TableUnreadable)?;
    mem.read_obj(GuestAddress(addr))
        .map_err(|_| BadDescriptor::TableUnreadable)
}

fn payload(mem: &GuestMemoryMmap, d: Desc) -> Result<PktBuf, BadDescriptor> {
    if d.len > 0 {
        mem.get_slice(GuestAddress(d.addr), d.len as usize)
            .map_err(|_| BadDescriptor::AddressOutOfRange)?;
    }
    Ok(PktBuf {
        addr: GuestAddress(d.addr),
        left: d.len,
    })
}
