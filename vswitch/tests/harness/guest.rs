//! A simulated guest: shared memory, negotiated device, two driver
//! queues and helpers to move frames in and out.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;

use nix::libc;
use vm_memory::mmap::{GuestRegionMmap, MmapRegion};
use vm_memory::{Bytes, FileOffset, GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use vswitch::port::VirtioPort;
use vswitch::virtio::{
    RX_QUEUE, STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK, TX_QUEUE,
    VIRTIO_F_VERSION_1, VIRTIO_NET_F_MRG_RXBUF, VIRTIO_NET_HDR_SIZE, VirtioNetHdr,
};

use super::virtqueue::DriverQueue;

const MEM_SIZE: u64 = 2 * 1024 * 1024;
const RX_RING_BASE: u64 = 0x1000;
const TX_RING_BASE: u64 = 0x8000;
const BUF_BASE: u64 = 0x20000;

/// A memfd-backed shared memory plus a mapped view of it, for tests
/// that hand the fd to a port over the control socket.
pub fn shared_memory(size: u64) -> (File, GuestMemoryMmap) {
    let file = memfd(size).expect("memfd");
    let mem =
        GuestMemoryMmap::from_regions(vec![file_region(&file, size)]).expect("guest view");
    (file, mem)
}

fn memfd(size: u64) -> io::Result<File> {
    let name = c"vswitch-test-guest";
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor we own.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(size)?;
    Ok(file)
}

fn file_region(file: &File, size: u64) -> GuestRegionMmap {
    let region = MmapRegion::from_file(
        FileOffset::new(file.try_clone().expect("dup memfd"), 0),
        size as usize,
    )
    .expect("mmap memfd");
    GuestRegionMmap::new(region, GuestAddress(0)).expect("guest region")
}

/// Guest-side view of one attached port.
pub struct TestGuest {
    pub mem: GuestMemoryMmap,
    pub rx: DriverQueue,
    pub tx: DriverQueue,
    /// Driver-notification interrupt; non-blocking so tests can poll
    /// the count.
    pub call: EventFd,
    rx_bufs: HashMap<u16, (u64, u32)>,
    next_buf: u64,
}

impl TestGuest {
    /// Attach with the default feature set (mergeable RX buffers).
    pub fn attach(port: &mut VirtioPort, qsize: u16) -> TestGuest {
        Self::attach_with_features(port, qsize, VIRTIO_NET_F_MRG_RXBUF)
    }

    /// Run the whole driver bring-up against the port's device.
    pub fn attach_with_features(port: &mut VirtioPort, qsize: u16, features: u64) -> TestGuest {
        let file = memfd(MEM_SIZE).expect("memfd");

        let dev = port.dev_mut();
        dev.add_region(file_region(&file, MEM_SIZE))
            .expect("register dataspace");
        let mem = GuestMemoryMmap::from_regions(vec![file_region(&file, MEM_SIZE)])
            .expect("guest view");

        dev.set_status(STATUS_ACKNOWLEDGE);
        dev.set_status(STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        dev.set_driver_features(VIRTIO_F_VERSION_1 | (features & dev.host_features()));
        dev.set_status(STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK);
        assert!(
            dev.status() & STATUS_FEATURES_OK != 0,
            "feature negotiation failed"
        );

        let mut rx = DriverQueue::new(qsize, RX_RING_BASE);
        let mut tx = DriverQueue::new(qsize, TX_RING_BASE);
        rx.init(&mem).expect("init rx rings");
        tx.init(&mem).expect("init tx rings");
        dev.setup_queue(
            RX_QUEUE,
            qsize,
            GuestAddress(rx.desc_addr()),
            GuestAddress(rx.avail_addr()),
            GuestAddress(rx.used_addr()),
        )
        .expect("rx queue setup");
        dev.setup_queue(
            TX_QUEUE,
            qsize,
            GuestAddress(tx.desc_addr()),
            GuestAddress(tx.avail_addr()),
            GuestAddress(tx.used_addr()),
        )
        .expect("tx queue setup");

        dev.set_status(
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK,
        );
        assert!(dev.live(), "device failed to come up");

        let call = EventFd::new(libc::EFD_NONBLOCK).expect("call eventfd");
        dev.set_call_fd(call.try_clone().expect("dup call fd"));

        TestGuest {
            mem,
            rx,
            tx,
            call,
            rx_bufs: HashMap::new(),
            next_buf: BUF_BASE,
        }
    }

    pub fn alloc(&mut self, size: u32) -> u64 {
        let addr = self.next_buf;
        self.next_buf += (u64::from(size) + 15) & !15;
        assert!(self.next_buf <= MEM_SIZE, "test guest memory exhausted");
        addr
    }

    /// Post one device-writable RX buffer.
    pub fn add_rx_buffer(&mut self, size: u32) -> u16 {
        let addr = self.alloc(size);
        let head = self
            .rx
            .add_buf(&self.mem, &[(addr, size)], true)
            .expect("rx ring full");
        self.rx_bufs.insert(head, (addr, size));
        head
    }

    /// Queue one TX frame as a single descriptor (header + payload).
    pub fn queue_tx_frame(&mut self, hdr: &VirtioNetHdr, frame: &[u8]) -> u16 {
        let total = VIRTIO_NET_HDR_SIZE + frame.len();
        let addr = self.alloc(total as u32);
        self.mem
            .write_slice(vm_memory::ByteValued::as_slice(hdr), GuestAddress(addr))
            .unwrap();
        self.mem
            .write_slice(frame, GuestAddress(addr + VIRTIO_NET_HDR_SIZE as u64))
            .unwrap();
        self.tx
            .add_buf(&self.mem, &[(addr, total as u32)], false)
            .expect("tx ring full")
    }

    /// Queue one TX frame with the header and payload in separate
    /// chained descriptors.
    pub fn queue_tx_frame_split(&mut self, hdr: &VirtioNetHdr, frame: &[u8]) -> u16 {
        let hdr_addr = self.alloc(VIRTIO_NET_HDR_SIZE as u32);
        let frame_addr = self.alloc(frame.len() as u32);
        self.mem
            .write_slice(vm_memory::ByteValued::as_slice(hdr), GuestAddress(hdr_addr))
            .unwrap();
        self.mem
            .write_slice(frame, GuestAddress(frame_addr))
            .unwrap();
        self.tx
            .add_buf(
                &self.mem,
                &[
                    (hdr_addr, VIRTIO_NET_HDR_SIZE as u32),
                    (frame_addr, frame.len() as u32),
                ],
                false,
            )
            .expect("tx ring full")
    }

    /// Completed TX heads.
    pub fn tx_completions(&mut self) -> usize {
        let mut n = 0;
        while self.tx.pop_used(&self.mem).is_some() {
            n += 1;
        }
        n
    }

    /// Drain received frames: `(header, payload)` pairs, merge
    /// continuations joined.
    pub fn recv_frames(&mut self) -> Vec<(VirtioNetHdr, Vec<u8>)> {
        let mut frames = Vec::new();
        while let Some(first) = self.rx.pop_used(&self.mem) {
            let (addr, _) = self.rx_bufs[&first.head];
            let mut hdr = VirtioNetHdr::default();
            self.mem
                .read_slice(
                    vm_memory::ByteValued::as_mut_slice(&mut hdr),
                    GuestAddress(addr),
                )
                .unwrap();

            assert!(first.len as usize >= VIRTIO_NET_HDR_SIZE);
            let mut payload =
                vec![0u8; first.len as usize - VIRTIO_NET_HDR_SIZE];
            self.mem
                .read_slice(&mut payload, GuestAddress(addr + VIRTIO_NET_HDR_SIZE as u64))
                .unwrap();

            for _ in 1..u16::from(hdr.num_buffers).max(1) {
                let cont = self.rx.pop_used(&self.mem).expect("merge continuation");
                let (addr, _) = self.rx_bufs[&cont.head];
                let mut chunk = vec![0u8; cont.len as usize];
                self.mem.read_slice(&mut chunk, GuestAddress(addr)).unwrap();
                payload.extend_from_slice(&chunk);
            }
            frames.push((hdr, payload));
        }
        frames
    }

    /// Used entries pending on the RX ring (without consuming them).
    pub fn rx_used_pending(&self) -> u16 {
        self.rx.used_pending(&self.mem)
    }

    /// Driver interrupts received since the last call.
    pub fn irq_count(&self) -> u64 {
        match self.call.read() {
            Ok(n) => n,
            Err(_) => 0,
        }
    }
}
