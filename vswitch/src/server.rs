//! Single-threaded event loop tying sockets, interrupts and the
//! switching engine together.
//!
//! Four kinds of events arrive here: factory create requests, port
//! transport messages, guest kick interrupts (delegated to the
//! engine's TX dispatcher) and the per-port TX-reschedule interrupts.
//! Port-socket hangup doubles as the peer-gone signal.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, UnixAddr, accept, bind, listen, socket,
    socketpair,
};
use tracing::{debug, info, warn};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::factory::PortFactory;
use crate::mac_table::PortId;
use crate::port::SwitchPort;
use crate::switch::VirtioSwitch;
use crate::transport::{
    self, PortAction, PortMsg, encode_create_err, encode_create_ok, errno_of_factory,
    parse_create_request, recv_datagram, send_datagram,
};

const EVENTS_LEN: usize = 32;

/// Epoll token kinds (upper 32 bits of the token).
const TOK_LISTENER: u64 = 0;
const TOK_FACTORY_CONN: u64 = 1;
const TOK_PORT_SOCK: u64 = 2;
const TOK_KICK: u64 = 3;
const TOK_RESCHED: u64 = 4;
const TOK_SHUTDOWN: u64 = 5;

/// Port key in the lower 32 token bits; the monitor gets a reserved
/// value outside the port array.
const MONITOR_KEY: u32 = u32::MAX;

fn token(kind: u64, value: u32) -> u64 {
    kind << 32 | u64::from(value)
}

/// Per-port control-plane wiring.
struct PortWiring {
    sock: OwnedFd,
    kick: Option<EventFd>,
}

pub struct Server {
    epoll: Epoll,
    switch: VirtioSwitch,
    factory: PortFactory,
    listener: OwnedFd,
    socket_path: PathBuf,
    factory_conns: HashMap<RawFd, OwnedFd>,
    wirings: HashMap<u32, PortWiring>,
    /// Written by the signal handler (or a test) to stop the loop.
    shutdown: EventFd,
}

impl Server {
    pub fn new(
        switch: VirtioSwitch,
        factory: PortFactory,
        socket_path: &Path,
    ) -> io::Result<Server> {
        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(socket_path)?;
        bind(listener.as_raw_fd(), &addr)?;
        listen(&listener, Backlog::new(16).expect("valid backlog"))?;

        let epoll = Epoll::new()?;
        epoll.ctl(
            ControlOperation::Add,
            listener.as_raw_fd(),
            EpollEvent::new(EventSet::IN, token(TOK_LISTENER, 0)),
        )?;

        let shutdown = EventFd::new(0)?;
        epoll.ctl(
            ControlOperation::Add,
            shutdown.as_raw_fd(),
            EpollEvent::new(EventSet::IN, token(TOK_SHUTDOWN, 0)),
        )?;

        info!(socket = %socket_path.display(), "factory listening");

        Ok(Server {
            epoll,
            switch,
            factory,
            listener,
            socket_path: socket_path.to_path_buf(),
            factory_conns: HashMap::new(),
            wirings: HashMap::new(),
            shutdown,
        })
    }

    /// A handle that stops the loop when written to; wire it to the
    /// process signal handlers.
    pub fn shutdown_handle(&self) -> io::Result<EventFd> {
        self.shutdown.try_clone()
    }

    pub fn switch(&self) -> &VirtioSwitch {
        &self.switch
    }

    /// Attach an uplink port to the switch and register its receive
    /// interrupt.
    pub fn add_uplink(&mut self, port: SwitchPort) -> io::Result<PortId> {
        let id = self
            .switch
            .add_port(port)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let key = u32::from(id.0);

        if let Some(SwitchPort::Uplink(p)) = self.switch.port(id) {
            if let Some(irq) = p.recv_irq() {
                self.epoll.ctl(
                    ControlOperation::Add,
                    irq.as_raw_fd(),
                    EpollEvent::new(EventSet::IN, token(TOK_KICK, key)),
                )?;
            }
            self.epoll.ctl(
                ControlOperation::Add,
                p.reschedule_fd().as_raw_fd(),
                EpollEvent::new(EventSet::IN, token(TOK_RESCHED, key)),
            )?;
        }
        Ok(id)
    }

    /// Run until the shutdown handle fires.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = vec![EpollEvent::default(); EVENTS_LEN];
        loop {
            let n = match self.epoll.wait(-1, &mut events) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            for ev in &events[..n] {
                let tok = ev.data();
                let (kind, value) = (tok >> 32, tok as u32);
                match kind {
                    TOK_LISTENER => self.accept_factory_conn(),
                    TOK_FACTORY_CONN => self.handle_factory_conn(value as RawFd),
                    TOK_PORT_SOCK => self.handle_port_sock(value, ev.event_set()),
                    TOK_KICK => self.handle_kick(value),
                    TOK_RESCHED => self.handle_reschedule(value),
                    TOK_SHUTDOWN => {
                        info!("shutdown requested");
                        return Ok(());
                    }
                    _ => warn!(token = tok, "spurious epoll event"),
                }
            }
        }
    }

    fn accept_factory_conn(&mut self) {
        let conn = match accept(self.listener.as_raw_fd()) {
            // SAFETY: accept hands us a fresh, owned descriptor.
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };
        let raw = conn.as_raw_fd();
        if let Err(e) = self.epoll.ctl(
            ControlOperation::Add,
            raw,
            EpollEvent::new(EventSet::IN, token(TOK_FACTORY_CONN, raw as u32)),
        ) {
            warn!(error = %e, "cannot watch factory connection");
            return;
        }
        debug!(fd = raw, "factory client connected");
        self.factory_conns.insert(raw, conn);
    }

    fn handle_factory_conn(&mut self, raw: RawFd) {
        let Some(conn) = self.factory_conns.get(&raw) else {
            return;
        };
        let msg = match recv_datagram(conn.as_fd()) {
            Ok(Some((buf, _fds))) => buf,
            Ok(None) => {
                self.drop_factory_conn(raw);
                return;
            }
            Err(e) => {
                warn!(error = %e, "factory receive failed");
                self.drop_factory_conn(raw);
                return;
            }
        };

        let reply = match parse_create_request(&msg) {
            Ok(opts) => {
                let opts: Vec<&str> = opts.iter().map(String::as_str).collect();
                self.create_port(&opts)
            }
            Err(_) => Err(nix::errno::Errno::EINVAL),
        };

        let conn = self.factory_conns.get(&raw).expect("conn still present");
        let sent = match reply {
            Ok((name, client_end)) => send_datagram(
                conn.as_fd(),
                &encode_create_ok(&name),
                Some(client_end.as_fd()),
            ),
            Err(errno) => send_datagram(conn.as_fd(), &encode_create_err(errno), None),
        };
        if let Err(e) = sent {
            warn!(error = %e, "factory reply failed");
            self.drop_factory_conn(raw);
        }
    }

    fn drop_factory_conn(&mut self, raw: RawFd) {
        if let Some(conn) = self.factory_conns.remove(&raw) {
            let _ = self.epoll.ctl(
                ControlOperation::Delete,
                conn.as_raw_fd(),
                EpollEvent::default(),
            );
            debug!(fd = raw, "factory client disconnected");
        }
    }

    /// Create a port and hand back (name, client socket end).
    fn create_port(&mut self, opts: &[&str]) -> Result<(String, OwnedFd), nix::errno::Errno> {
        let created = self
            .factory
            .create(&mut self.switch, opts)
            .map_err(|e| errno_of_factory(&e))?;

        let key = match created {
            Some(id) => u32::from(id.0),
            None => MONITOR_KEY,
        };
        let (name, resched) = {
            let port = self.port_by_key(key).expect("port just created");
            (port.name().to_string(), port.reschedule_fd().as_raw_fd())
        };

        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .inspect_err(|_| {
            // Roll the half-created port back; the peer never existed.
            self.mark_gone(key);
            self.reap_ports();
        })?;

        if self
            .epoll
            .ctl(
                ControlOperation::Add,
                ours.as_raw_fd(),
                EpollEvent::new(EventSet::IN, token(TOK_PORT_SOCK, key)),
            )
            .is_err()
        {
            self.mark_gone(key);
            self.reap_ports();
            return Err(nix::errno::Errno::EIO);
        }
        if key != MONITOR_KEY {
            let _ = self.epoll.ctl(
                ControlOperation::Add,
                resched,
                EpollEvent::new(EventSet::IN, token(TOK_RESCHED, key)),
            );
        }
        self.wirings.insert(key, PortWiring { sock: ours, kick: None });

        info!(target: "port", name, "port created");
        Ok((name, theirs))
    }

    fn port_by_key(&mut self, key: u32) -> Option<&mut SwitchPort> {
        if key == MONITOR_KEY {
            self.switch.monitor_mut()
        } else {
            self.switch.port_mut(PortId(key as u16))
        }
    }

    fn mark_gone(&mut self, key: u32) {
        if let Some(SwitchPort::Virtio(p)) = self.port_by_key(key) {
            p.set_gone();
        }
    }

    fn handle_port_sock(&mut self, key: u32, set: EventSet) {
        if set.contains(EventSet::IN) {
            let Some(wiring) = self.wirings.get(&key) else {
                return;
            };
            match recv_datagram(wiring.sock.as_fd()) {
                Ok(Some((buf, mut fds))) => self.apply_port_message(key, buf, &mut fds),
                Ok(None) => {
                    self.peer_gone(key);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "port socket receive failed");
                    self.peer_gone(key);
                    return;
                }
            }
        }
        if set.contains(EventSet::HANG_UP) {
            self.peer_gone(key);
        }
    }

    fn apply_port_message(&mut self, key: u32, buf: Vec<u8>, fds: &mut Vec<OwnedFd>) {
        let msg = match PortMsg::decode(&buf, fds) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "rejecting malformed port message");
                self.send_port_reply(
                    key,
                    &transport::encode_reply(-(nix::errno::Errno::EINVAL as i32), &[]),
                );
                return;
            }
        };

        let Some(SwitchPort::Virtio(port)) = self.port_by_key(key) else {
            return;
        };
        let (reply, action) = transport::apply_port_msg(port.dev_mut(), msg);

        match action {
            PortAction::None => {}
            PortAction::RegisterKick(kick) => self.register_kick(key, kick),
        }
        self.send_port_reply(key, &reply);
    }

    fn register_kick(&mut self, key: u32, kick: EventFd) {
        let Some(wiring) = self.wirings.get_mut(&key) else {
            return;
        };
        if let Some(old) = wiring.kick.take() {
            let _ = self.epoll.ctl(
                ControlOperation::Delete,
                old.as_raw_fd(),
                EpollEvent::default(),
            );
        }
        if let Err(e) = self.epoll.ctl(
            ControlOperation::Add,
            kick.as_raw_fd(),
            EpollEvent::new(EventSet::IN, token(TOK_KICK, key)),
        ) {
            warn!(error = %e, "cannot watch kick fd");
            return;
        }
        wiring.kick = Some(kick);
    }

    fn send_port_reply(&self, key: u32, reply: &[u8]) {
        if let Some(wiring) = self.wirings.get(&key)
            && let Err(e) = send_datagram(wiring.sock.as_fd(), reply, None)
        {
            debug!(error = %e, "port reply failed");
        }
    }

    fn handle_kick(&mut self, key: u32) {
        // Clear the edge; the fd stays registered.
        if let Some(wiring) = self.wirings.get(&key)
            && let Some(kick) = &wiring.kick
        {
            let _ = kick.read();
        }

        if key == MONITOR_KEY {
            self.switch.handle_monitor_kick();
            return;
        }
        let id = PortId(key as u16);
        match self.switch.port(id) {
            Some(SwitchPort::Virtio(_)) => {
                self.switch.handle_port_tx(id);
            }
            Some(SwitchPort::Uplink(_)) => self.handle_uplink_recv(id),
            None => {}
        }
    }

    fn handle_uplink_recv(&mut self, id: PortId) {
        let pending = match self.switch.port_mut(id) {
            Some(SwitchPort::Uplink(p)) => {
                if let Some(irq) = p.recv_irq() {
                    let _ = irq.read();
                }
                p.driver().check_recv_irq(0)
            }
            _ => return,
        };
        if !pending {
            return;
        }
        if self.switch.handle_port_tx(id)
            && let Some(SwitchPort::Uplink(p)) = self.switch.port_mut(id)
        {
            p.driver().ack_recv_irq(0);
        }
    }

    fn handle_reschedule(&mut self, key: u32) {
        let id = PortId(key as u16);
        if let Some(port) = self.switch.port(id) {
            let _ = port.reschedule_fd().read();
        }
        match self.switch.port(id) {
            Some(SwitchPort::Virtio(_)) => {
                self.switch.handle_port_tx(id);
            }
            Some(SwitchPort::Uplink(_)) => {
                if self.switch.handle_port_tx(id)
                    && let Some(SwitchPort::Uplink(p)) = self.switch.port_mut(id)
                {
                    p.driver().ack_recv_irq(0);
                }
            }
            None => {}
        }
    }

    /// Capability-deletion signal: flag the port and reap.
    fn peer_gone(&mut self, key: u32) {
        self.mark_gone(key);
        self.reap_ports();
    }

    fn reap_ports(&mut self) {
        let reaped = self.switch.check_ports();
        if reaped.is_empty() {
            return;
        }

        // Drop every wiring whose port no longer exists.
        let stale: Vec<u32> = self
            .wirings
            .keys()
            .copied()
            .filter(|&k| {
                if k == MONITOR_KEY {
                    self.switch.monitor().is_none()
                } else {
                    self.switch.port(PortId(k as u16)).is_none()
                }
            })
            .collect();
        for key in stale {
            if let Some(wiring) = self.wirings.remove(&key) {
                let _ = self.epoll.ctl(
                    ControlOperation::Delete,
                    wiring.sock.as_raw_fd(),
                    EpollEvent::default(),
                );
                if let Some(kick) = wiring.kick {
                    let _ = self.epoll.ctl(
                        ControlOperation::Delete,
                        kick.as_raw_fd(),
                        EpollEvent::default(),
                    );
                }
            }
        }

        for port in reaped {
            let _ = self.epoll.ctl(
                ControlOperation::Delete,
                port.reschedule_fd().as_raw_fd(),
                EpollEvent::default(),
            );
            info!(target: "port", port = port.name(), "port removed");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
