//! The switching engine: port array, MAC learning, routing policy and
//! TX-burst fairness.

use std::sync::atomic::{Ordering, fence};

use tracing::{debug, trace, warn};

use crate::filter::{AllowAll, PacketFilter, filter_frame};
use crate::mac_table::{MacTable, PortId};
use crate::port::{DeliverResult, PortRequest, SwitchPort};
use crate::virtio::BadDescriptor;
use crate::vlan::RoleKind;

/// Frames a port may transmit per engine entry before the rest of its
/// queue is deferred to a reschedule interrupt.
pub const TX_BURST: u32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum AddPortError {
    #[error("MAC address already in use")]
    DuplicateMac,
    #[error("no port slot available")]
    SlotExhausted,
    #[error("monitor port already bound")]
    MonitorAlreadyBound,
}

/// The switch: all ports, the optional monitor, and the MAC table.
pub struct VirtioSwitch {
    ports: Vec<Option<SwitchPort>>,
    monitor: Option<SwitchPort>,
    mac_table: MacTable,
    filter: Box<dyn PacketFilter>,
}

impl VirtioSwitch {
    pub fn new(max_ports: usize) -> Self {
        VirtioSwitch {
            ports: (0..max_ports).map(|_| None).collect(),
            monitor: None,
            mac_table: MacTable::new(MacTable::DEFAULT_CAPACITY),
            filter: Box::new(AllowAll),
        }
    }

    /// Install the mirror-path filter.
    pub fn set_filter(&mut self, filter: Box<dyn PacketFilter>) {
        self.filter = filter;
    }

    fn lookup_free_slot(&self) -> Option<usize> {
        self.ports.iter().position(Option::is_none)
    }

    /// The index the next port would get, or `None` when full.
    pub fn port_available(&self, monitor: bool) -> Option<usize> {
        if monitor {
            self.monitor.is_none().then_some(0)
        } else {
            self.lookup_free_slot()
        }
    }

    pub fn add_port(&mut self, port: SwitchPort) -> Result<PortId, AddPortError> {
        if !port.mac().is_unknown()
            && self
                .ports
                .iter()
                .flatten()
                .any(|p| p.mac() == port.mac())
        {
            warn!(target: "port", port = port.name(),
                  "rejecting port, MAC address already in use");
            return Err(AddPortError::DuplicateMac);
        }

        let idx = self.lookup_free_slot().ok_or(AddPortError::SlotExhausted)?;
        debug!(target: "port", port = port.name(), idx, "port attached");
        self.ports[idx] = Some(port);
        Ok(PortId(idx as u16))
    }

    pub fn add_monitor_port(&mut self, port: SwitchPort) -> Result<(), AddPortError> {
        if let Some(monitor) = &self.monitor {
            warn!(target: "port", bound = monitor.name(), rejected = port.name(),
                  "monitor port already bound");
            return Err(AddPortError::MonitorAlreadyBound);
        }
        debug!(target: "port", port = port.name(), "monitor port attached");
        self.monitor = Some(port);
        Ok(())
    }

    pub fn port(&self, id: PortId) -> Option<&SwitchPort> {
        self.ports.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn port_mut(&mut self, id: PortId) -> Option<&mut SwitchPort> {
        self.ports.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn monitor(&self) -> Option<&SwitchPort> {
        self.monitor.as_ref()
    }

    pub fn monitor_mut(&mut self) -> Option<&mut SwitchPort> {
        self.monitor.as_mut()
    }

    pub fn port_ids(&self) -> impl Iterator<Item = PortId> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| PortId(i as u16))
    }

    /// Reap ports whose peer vanished, flushing their MAC-table
    /// entries first. The removed ports are handed back so the caller
    /// can unregister their fds before dropping them.
    pub fn check_ports(&mut self) -> Vec<SwitchPort> {
        let mut reaped = Vec::new();
        for idx in 0..self.ports.len() {
            if self.ports[idx].as_ref().is_some_and(SwitchPort::is_gone) {
                let port = self.ports[idx].take().expect("checked above");
                debug!(target: "port", port = port.name(), "peer gone, reaping port");
                self.mac_table.flush(PortId(idx as u16));
                reaped.push(port);
            }
        }
        if self.monitor.as_ref().is_some_and(SwitchPort::is_gone) {
            let port = self.monitor.take().expect("checked above");
            debug!(target: "port", port = port.name(), "peer gone, reaping monitor");
            reaped.push(port);
        }
        reaped
    }

    fn all_rx_notify_disable_and_remember(&mut self) {
        for port in self.ports.iter_mut().flatten() {
            port.rx_notify_disable_and_remember();
        }
    }

    fn all_rx_notify_emit_and_enable(&mut self) {
        for port in self.ports.iter_mut().flatten() {
            port.rx_notify_emit_and_enable();
        }
    }

    /// Drain a port's TX queue, bounded by [`TX_BURST`].
    ///
    /// Returns `true` when the queue was fully processed; `false`
    /// when the rest was deferred to the port's reschedule interrupt
    /// or the port faulted.
    pub fn handle_port_tx(&mut self, id: PortId) -> bool {
        match self.port(id) {
            None => return true,
            // A device that is not live has no queues we may touch.
            Some(SwitchPort::Virtio(p)) if !p.dev().live() => return true,
            Some(_) => {}
        }

        if !self
            .port_mut(id)
            .map(|p| p.tx_work_pending())
            .unwrap_or(false)
        {
            trace!(target: "port", port = %id, "irq without pending work");
        }

        let mut handled: u32 = 0;
        loop {
            {
                let port = self.port_mut(id).expect("checked above");
                port.tx_notify_disable();
                port.rx_ring_notify_disable();
            }

            if handled >= TX_BURST {
                debug!(target: "port", port = %id,
                       "tx burst limit hit, rescheduling remaining work");
                // Notifications stay disabled until the reschedule
                // handler re-enters this dispatcher.
                self.port_mut(id).expect("checked above").reschedule_pending_tx();
                return false;
            }

            // Coalesce destination interrupts across the drain.
            self.all_rx_notify_disable_and_remember();

            let fault = loop {
                let req = match self.port_mut(id).expect("checked above").take_next_tx() {
                    Ok(Some(req)) => req,
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                };
                if let Err(e) = self.route(id, req) {
                    break Some(e);
                }
                handled += 1;
                if handled >= TX_BURST {
                    break None;
                }
            };

            self.all_rx_notify_emit_and_enable();

            if let Some(e) = fault {
                warn!(target: "port", port = %id, error = %e,
                      "bad descriptor, signalling device error");
                self.port_mut(id).expect("checked above").device_error();
                return false;
            }

            {
                let port = self.port_mut(id).expect("checked above");
                port.tx_notify_enable();
                port.rx_ring_notify_enable();
            }

            // Make the re-enabled notify flags visible before the
            // final drain check, and fresh heads visible to it.
            fence(Ordering::SeqCst);

            if !self
                .port_mut(id)
                .map(|p| p.tx_work_pending())
                .unwrap_or(false)
            {
                return true;
            }
        }
    }

    /// Monitor ports never transmit: complete and discard everything
    /// pending on the monitor's TX queue.
    pub fn handle_monitor_kick(&mut self) {
        let Some(SwitchPort::Virtio(mon)) = self.monitor.as_mut() else {
            return;
        };
        if !mon.dev().live() {
            return;
        }
        loop {
            {
                let (mem, tx) = mon.dev().tx_ref();
                tx.disable_notify(mem);
                let (mem, rx) = mon.dev().rx_ref();
                rx.disable_notify(mem);
            }

            mon.drop_requests();

            {
                let (mem, tx) = mon.dev().tx_ref();
                tx.enable_notify(mem);
                let (mem, rx) = mon.dev().rx_ref();
                rx.enable_notify(mem);
            }
            fence(Ordering::SeqCst);

            if !mon.tx_work_pending() {
                return;
            }
        }
    }

    /// Route one request: ingress VLAN policy, learning, then unicast,
    /// flood and mirror delivery.
    ///
    /// `Err` means the source chain is malformed; the caller latches
    /// the source device and the TX used entry is never published.
    fn route(&mut self, src_id: PortId, req: PortRequest) -> Result<(), BadDescriptor> {
        let (src_kind, vlan, ingress_drop) = {
            let src = self.port(src_id).expect("routing for missing port");
            let role = src.role();

            // Trunk ports only accept frames of a configured VLAN;
            // access ports must see untagged frames (prevents double
            // tagging).
            let drop = (role.is_trunk() && !role.match_vlan(req.vlan_id()))
                || (role.is_access() && req.has_vlan());
            let vlan = if req.has_vlan() {
                req.vlan_id()
            } else {
                role.port_vlan()
            };
            (role.kind(), vlan, drop)
        };

        if ingress_drop {
            trace!(target: "packet", port = %src_id, vlan, "ingress policy drop");
            self.port_mut(src_id).expect("checked above").complete_tx(req);
            return Ok(());
        }

        trace!(target: "packet", port = %src_id, src = %req.src_mac(),
               dst = %req.dst_mac(), vlan, "frame");

        self.mac_table.learn(req.src_mac(), src_id, vlan);

        let dst = req.dst_mac();
        let mut routed = false;
        if !dst.is_broadcast() {
            if let Some(target) = self.mac_table.lookup(dst, vlan) {
                // Do not send frames back out the port they came in
                // on; another switch may have flooded them to us.
                if target != src_id {
                    self.deliver_to(target, src_kind, &req)?;
                    self.mirror(src_kind, &req)?;
                }
                routed = true;
            }
        }

        if !routed {
            // Broadcast or unknown destination: all eligible ports.
            for t in 0..self.ports.len() {
                let target = PortId(t as u16);
                if target == src_id {
                    continue;
                }
                let eligible = self
                    .port(target)
                    .is_some_and(|p| p.role().match_vlan(vlan));
                if eligible {
                    self.deliver_to(target, src_kind, &req)?;
                }
            }
            self.mirror(src_kind, &req)?;
        }

        self.port_mut(src_id).expect("checked above").complete_tx(req);
        Ok(())
    }

    fn deliver_to(
        &mut self,
        target: PortId,
        src_kind: RoleKind,
        req: &PortRequest,
    ) -> Result<DeliverResult, BadDescriptor> {
        let mut xfer = req.transfer();
        let port = self.port_mut(target).expect("eligible port vanished");
        let res = port.deliver(src_kind, &mut xfer)?;
        if res == DeliverResult::Exception {
            warn!(target: "port", port = %target, "destination faulted during delivery");
        }
        Ok(res)
    }

    fn mirror(&mut self, src_kind: RoleKind, req: &PortRequest) -> Result<(), BadDescriptor> {
        if self.monitor.is_none() || filter_frame(self.filter.as_ref(), req.frame_prefix()) {
            return Ok(());
        }
        let mut xfer = req.transfer();
        let mon = self.monitor.as_mut().expect("checked above");
        mon.deliver(src_kind, &mut xfer)?;
        Ok(())
    }
}
