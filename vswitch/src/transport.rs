//! Control-plane wire protocol.
//!
//! Each port is served over a Unix seqpacket socket: one datagram per
//! message, little-endian fixed layouts, fds (dataspace memfds,
//! interrupt eventfds) attached via `SCM_RIGHTS`. The socket itself
//! is the client's handle to the port; hangup is the peer-gone
//! signal. The factory listens on a separate socket and answers
//! create requests with a connected port socket.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tracing::{debug, warn};
use vm_memory::mmap::{GuestRegionMmap, MmapRegion};
use vm_memory::{FileOffset, GuestAddress};
use vmm_sys_util::eventfd::EventFd;

use crate::factory::FactoryError;
use crate::switch::AddPortError;
use crate::virtio::device::DeviceError;
use crate::virtio::queue::QueueConfigError;
use crate::virtio::{DataspaceId, VirtioNetDev};

/// Largest accepted control datagram.
pub const MAX_MSG_SIZE: usize = 512;

/// Port protocol opcodes.
const OP_GET_FEATURES: u8 = 1;
const OP_SET_FEATURES: u8 = 2;
const OP_GET_CONFIG: u8 = 3;
const OP_SET_CONFIG: u8 = 4;
const OP_GET_STATUS: u8 = 5;
const OP_SET_STATUS: u8 = 6;
const OP_ADD_DATASPACE: u8 = 7;
const OP_SETUP_QUEUE: u8 = 8;
const OP_SET_KICK_FD: u8 = 9;
const OP_SET_CALL_FD: u8 = 10;
const OP_GET_IRQ_STATUS: u8 = 11;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed message")]
    Malformed,
    #[error("message carries no fd where one is required")]
    MissingFd,
    #[error("socket error: {0}")]
    Socket(#[from] Errno),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One decoded port-protocol request.
pub enum PortMsg {
    GetFeatures,
    SetFeatures(u64),
    GetConfig { offset: u32, len: u32 },
    SetConfig { offset: u32, data: Vec<u8> },
    GetStatus,
    SetStatus(u8),
    AddDataspace {
        guest_addr: u64,
        size: u64,
        offset: u64,
        fd: OwnedFd,
    },
    SetupQueue {
        index: u16,
        size: u16,
        desc: u64,
        avail: u64,
        used: u64,
    },
    SetKickFd(OwnedFd),
    SetCallFd(OwnedFd),
    GetIrqStatus,
}

fn le16(b: &[u8]) -> u16 {
    u16::from_le_bytes(b[..2].try_into().unwrap())
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes(b[..4].try_into().unwrap())
}

fn le64(b: &[u8]) -> u64 {
    u64::from_le_bytes(b[..8].try_into().unwrap())
}

impl PortMsg {
    pub fn decode(buf: &[u8], fds: &mut Vec<OwnedFd>) -> Result<PortMsg, TransportError> {
        let (&op, p) = buf.split_first().ok_or(TransportError::Malformed)?;
        let mut take_fd = || fds.pop().ok_or(TransportError::MissingFd);

        let msg = match op {
            OP_GET_FEATURES if p.is_empty() => PortMsg::GetFeatures,
            OP_SET_FEATURES if p.len() == 8 => PortMsg::SetFeatures(le64(p)),
            OP_GET_CONFIG if p.len() == 8 => PortMsg::GetConfig {
                offset: le32(p),
                len: le32(&p[4..]),
            },
            OP_SET_CONFIG if p.len() >= 4 => PortMsg::SetConfig {
                offset: le32(p),
                data: p[4..].to_vec(),
            },
            OP_GET_STATUS if p.is_empty() => PortMsg::GetStatus,
            OP_SET_STATUS if p.len() == 1 => PortMsg::SetStatus(p[0]),
            OP_ADD_DATASPACE if p.len() == 24 => PortMsg::AddDataspace {
                guest_addr: le64(p),
                size: le64(&p[8..]),
                offset: le64(&p[16..]),
                fd: take_fd()?,
            },
            OP_SETUP_QUEUE if p.len() == 28 => PortMsg::SetupQueue {
                index: le16(p),
                size: le16(&p[2..]),
                desc: le64(&p[4..]),
                avail: le64(&p[12..]),
                used: le64(&p[20..]),
            },
            OP_SET_KICK_FD if p.is_empty() => PortMsg::SetKickFd(take_fd()?),
            OP_SET_CALL_FD if p.is_empty() => PortMsg::SetCallFd(take_fd()?),
            OP_GET_IRQ_STATUS if p.is_empty() => PortMsg::GetIrqStatus,
            _ => return Err(TransportError::Malformed),
        };
        Ok(msg)
    }

    /// Encode a request (used by clients and the test harness).
    pub fn encode(&self) -> (Vec<u8>, Option<RawFd>) {
        let mut buf = Vec::new();
        let mut fd = None;
        match self {
            PortMsg::GetFeatures => buf.push(OP_GET_FEATURES),
            PortMsg::SetFeatures(f) => {
                buf.push(OP_SET_FEATURES);
                buf.extend_from_slice(&f.to_le_bytes());
            }
            PortMsg::GetConfig { offset, len } => {
                buf.push(OP_GET_CONFIG);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
            PortMsg::SetConfig { offset, data } => {
                buf.push(OP_SET_CONFIG);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(data);
            }
            PortMsg::GetStatus => buf.push(OP_GET_STATUS),
            PortMsg::SetStatus(s) => {
                buf.push(OP_SET_STATUS);
                buf.push(*s);
            }
            PortMsg::AddDataspace {
                guest_addr,
                size,
                offset,
                fd: ds,
            } => {
                buf.push(OP_ADD_DATASPACE);
                buf.extend_from_slice(&guest_addr.to_le_bytes());
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                fd = Some(ds.as_raw_fd());
            }
            PortMsg::SetupQueue {
                index,
                size,
                desc,
                avail,
                used,
            } => {
                buf.push(OP_SETUP_QUEUE);
                buf.extend_from_slice(&index.to_le_bytes());
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&desc.to_le_bytes());
                buf.extend_from_slice(&avail.to_le_bytes());
                buf.extend_from_slice(&used.to_le_bytes());
            }
            PortMsg::SetKickFd(f) => {
                buf.push(OP_SET_KICK_FD);
                fd = Some(f.as_raw_fd());
            }
            PortMsg::SetCallFd(f) => {
                buf.push(OP_SET_CALL_FD);
                fd = Some(f.as_raw_fd());
            }
            PortMsg::GetIrqStatus => buf.push(OP_GET_IRQ_STATUS),
        }
        (buf, fd)
    }
}

/// Reply: `i32` status (0 or negative errno) followed by a payload.
pub fn encode_reply(status: i32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&status.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn decode_reply(buf: &[u8]) -> Result<(i32, &[u8]), TransportError> {
    if buf.len() < 4 {
        return Err(TransportError::Malformed);
    }
    Ok((i32::from_le_bytes(buf[..4].try_into().unwrap()), &buf[4..]))
}

fn errno_of_device(e: &DeviceError) -> Errno {
    match e {
        DeviceError::TooManyDataspaces => Errno::ENOMEM,
        DeviceError::UntrustedDataspace => Errno::EPERM,
        DeviceError::RegionOverlap => Errno::EINVAL,
        DeviceError::BadQueueIndex => Errno::ERANGE,
        DeviceError::QueueConfig(QueueConfigError::InvalidSize) => Errno::EINVAL,
        DeviceError::QueueConfig(QueueConfigError::Unmapped) => Errno::EINVAL,
    }
}

pub fn errno_of_factory(e: &FactoryError) -> Errno {
    match e {
        FactoryError::InvalidOption(_) => Errno::EINVAL,
        FactoryError::AddPort(AddPortError::SlotExhausted) => Errno::ENOMEM,
        FactoryError::AddPort(_) => Errno::EINVAL,
        FactoryError::Io(_) => Errno::EIO,
    }
}

/// What the caller must wire up after a message was applied.
pub enum PortAction {
    None,
    /// Register this eventfd as the port's TX/RX kick source.
    RegisterKick(EventFd),
}

/// Apply one decoded message to a port's device; returns the reply
/// datagram and any wiring action for the event loop.
pub fn apply_port_msg(dev: &mut VirtioNetDev, msg: PortMsg) -> (Vec<u8>, PortAction) {
    match msg {
        PortMsg::GetFeatures => (
            encode_reply(0, &dev.host_features().to_le_bytes()),
            PortAction::None,
        ),
        PortMsg::SetFeatures(f) => {
            dev.set_driver_features(f);
            (encode_reply(0, &[]), PortAction::None)
        }
        PortMsg::GetConfig { offset, len } => {
            let data = dev.read_config(offset, len);
            (encode_reply(0, &data), PortAction::None)
        }
        PortMsg::SetConfig { offset, data } => {
            dev.write_config(offset, &data);
            (encode_reply(0, &[]), PortAction::None)
        }
        PortMsg::GetStatus => (encode_reply(0, &[dev.status()]), PortAction::None),
        PortMsg::SetStatus(s) => {
            dev.set_status(s);
            (encode_reply(0, &[]), PortAction::None)
        }
        PortMsg::AddDataspace {
            guest_addr,
            size,
            offset,
            fd,
        } => {
            let reply = match add_dataspace(dev, guest_addr, size, offset, fd) {
                Ok(()) => encode_reply(0, &[]),
                Err(errno) => encode_reply(-(errno as i32), &[]),
            };
            (reply, PortAction::None)
        }
        PortMsg::SetupQueue {
            index,
            size,
            desc,
            avail,
            used,
        } => {
            let reply = match dev.setup_queue(
                index,
                size,
                GuestAddress(desc),
                GuestAddress(avail),
                GuestAddress(used),
            ) {
                Ok(()) => encode_reply(0, &[]),
                Err(e) => encode_reply(-(errno_of_device(&e) as i32), &[]),
            };
            (reply, PortAction::None)
        }
        PortMsg::SetKickFd(fd) => {
            // SAFETY: the fd was received via SCM_RIGHTS and is owned.
            let event = unsafe { EventFd::from_raw_fd(fd.into_raw_fd()) };
            (encode_reply(0, &[]), PortAction::RegisterKick(event))
        }
        PortMsg::SetCallFd(fd) => {
            // SAFETY: the fd was received via SCM_RIGHTS and is owned.
            let event = unsafe { EventFd::from_raw_fd(fd.into_raw_fd()) };
            dev.set_call_fd(event);
            (encode_reply(0, &[]), PortAction::None)
        }
        PortMsg::GetIrqStatus => (encode_reply(0, &[dev.take_isr()]), PortAction::None),
    }
}

fn add_dataspace(
    dev: &mut VirtioNetDev,
    guest_addr: u64,
    size: u64,
    offset: u64,
    fd: OwnedFd,
) -> Result<(), Errno> {
    let file = std::fs::File::from(fd);
    let id = dataspace_id(&file).map_err(|e| {
        warn!(target: "virtio", error = %e, "cannot stat dataspace fd");
        Errno::EBADF
    })?;
    if !dev.dataspace_trusted(id) {
        warn!(target: "virtio", "rejecting untrusted dataspace");
        return Err(Errno::EPERM);
    }

    let region = MmapRegion::from_file(FileOffset::new(file, offset), size as usize)
        .map_err(|_| Errno::EINVAL)?;
    let region =
        GuestRegionMmap::new(region, GuestAddress(guest_addr)).ok_or(Errno::EINVAL)?;
    dev.add_region(region).map_err(|e| {
        warn!(target: "virtio", error = %e, "dataspace registration failed");
        errno_of_device(&e)
    })?;
    debug!(target: "virtio", guest_addr, size, "dataspace registered");
    Ok(())
}

/// Receive one datagram plus any attached fds.
///
/// `Ok(None)` means the peer closed the connection.
pub fn recv_datagram(
    fd: BorrowedFd<'_>,
) -> Result<Option<(Vec<u8>, Vec<OwnedFd>)>, TransportError> {
    let mut buf = vec![0u8; MAX_MSG_SIZE];
    let mut cmsg = cmsg_space!([RawFd; 4]);
    let mut iov = [io::IoSliceMut::new(&mut buf)];

    let (len, fds) = {
        let msg = recvmsg::<()>(
            fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;
        let mut fds = Vec::new();
        for c in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(raw) = c {
                for r in raw {
                    // SAFETY: SCM_RIGHTS hands us ownership of the fd.
                    fds.push(unsafe { OwnedFd::from_raw_fd(r) });
                }
            }
        }
        (msg.bytes, fds)
    };

    if len == 0 {
        return Ok(None);
    }
    buf.truncate(len);
    Ok(Some((buf, fds)))
}

/// Send one datagram with an optional attached fd.
pub fn send_datagram(
    fd: BorrowedFd<'_>,
    buf: &[u8],
    attach: Option<BorrowedFd<'_>>,
) -> Result<(), TransportError> {
    let iov = [io::IoSlice::new(buf)];
    let raw;
    let cmsgs: &[ControlMessage] = match &attach {
        Some(a) => {
            raw = [a.as_raw_fd()];
            &[ControlMessage::ScmRights(&raw)]
        }
        None => &[],
    };
    sendmsg::<()>(fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

/// Identity of a dataspace's backing file for the trusted check.
pub fn dataspace_id(file: &std::fs::File) -> io::Result<DataspaceId> {
    use std::os::unix::fs::MetadataExt;
    let meta = file.metadata()?;
    Ok(DataspaceId {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

/// Parse a factory create request: `create [<option>...]`.
pub fn parse_create_request(buf: &[u8]) -> Result<Vec<String>, TransportError> {
    let text = std::str::from_utf8(buf).map_err(|_| TransportError::Malformed)?;
    let mut words = text.split_whitespace();
    if words.next() != Some("create") {
        return Err(TransportError::Malformed);
    }
    Ok(words.map(str::to_string).collect())
}

/// Factory replies are plain text: `OK <name>` (with the port socket
/// fd attached) or `ERR <errno>`.
pub fn encode_create_ok(name: &str) -> Vec<u8> {
    format!("OK {name}").into_bytes()
}

pub fn encode_create_err(errno: Errno) -> Vec<u8> {
    format!("ERR {}", errno as i32).into_bytes()
}
