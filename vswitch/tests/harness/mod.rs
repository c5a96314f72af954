//! Shared harness: a guest-side virtqueue driver, simulated guests
//! and frame builders.

#![allow(dead_code)]

pub mod frames;
pub mod guest;
pub mod virtqueue;

pub use frames::{BROADCAST, csum_hdr, ether_frame, mac, plain_hdr, tagged_frame};
pub use guest::TestGuest;

use vswitch::mac_table::PortId;
use vswitch::port::{SwitchPort, VirtioPort};
use vswitch::switch::VirtioSwitch;

/// The virtio port behind a switch slot.
pub fn vport(sw: &mut VirtioSwitch, id: PortId) -> &mut VirtioPort {
    match sw.port_mut(id).expect("port exists") {
        SwitchPort::Virtio(p) => p,
        SwitchPort::Uplink(_) => panic!("expected a virtio port"),
    }
}

/// The monitor's virtio port.
pub fn vmonitor(sw: &mut VirtioSwitch) -> &mut VirtioPort {
    match sw.monitor_mut().expect("monitor exists") {
        SwitchPort::Virtio(p) => p,
        SwitchPort::Uplink(_) => panic!("expected a virtio monitor"),
    }
}
