//! Port creation from declarative option strings.

use tracing::{info, warn};

use crate::mac_addr::MacAddr;
use crate::mac_table::PortId;
use crate::port::{SwitchPort, VirtioPort};
use crate::switch::{AddPortError, VirtioSwitch};
use crate::virtio::DataspaceId;
use crate::vlan::{PortRole, TrunkSet, vlan_valid_id};

/// Longest port name kept before the index suffix.
const NAME_MAX: usize = 19;

/// Dataspace registrations a client may request.
const DS_MAX_LIMIT: usize = 80;
const DS_MAX_DEFAULT: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("invalid option '{0}'")]
    InvalidOption(String),
    #[error(transparent)]
    AddPort(#[from] AddPortError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed create-request options.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PortConfig {
    pub monitor: bool,
    pub name: Option<String>,
    pub vlan_access: Option<u16>,
    pub vlan_trunk: Vec<u16>,
    pub vlan_trunk_all: bool,
    pub mac: Option<MacAddr>,
    pub ds_max: usize,
}

impl PortConfig {
    pub fn parse<'a>(opts: impl IntoIterator<Item = &'a str>) -> Result<Self, FactoryError> {
        let mut cfg = PortConfig {
            ds_max: DS_MAX_DEFAULT,
            ..Default::default()
        };

        for opt in opts {
            let invalid = || FactoryError::InvalidOption(opt.to_string());

            if let Some(ty) = opt.strip_prefix("type=") {
                match ty {
                    "monitor" => cfg.monitor = true,
                    "none" => {}
                    _ => return Err(invalid()),
                }
            } else if let Some(name) = opt.strip_prefix("name=") {
                cfg.name = Some(name.to_string());
            } else if let Some(spec) = opt.strip_prefix("vlan=access=") {
                let vid: u16 = spec.parse().map_err(|_| invalid())?;
                if !vlan_valid_id(vid) {
                    return Err(invalid());
                }
                cfg.vlan_access = Some(vid);
            } else if let Some(spec) = opt.strip_prefix("vlan=trunk=") {
                if spec == "all" {
                    cfg.vlan_trunk_all = true;
                } else {
                    for part in spec.split(',') {
                        let vid: u16 = part.parse().map_err(|_| invalid())?;
                        if !vlan_valid_id(vid) {
                            return Err(invalid());
                        }
                        cfg.vlan_trunk.push(vid);
                    }
                    if cfg.vlan_trunk.is_empty() {
                        return Err(invalid());
                    }
                }
            } else if let Some(mac) = opt.strip_prefix("mac=") {
                cfg.mac = Some(mac.parse().map_err(|_| invalid())?);
            } else if let Some(n) = opt.strip_prefix("ds-max=") {
                let n: usize = n.parse().map_err(|_| invalid())?;
                if n == 0 || n > DS_MAX_LIMIT {
                    warn!(target: "port", n, "requested dataspace limit out of range");
                    return Err(invalid());
                }
                cfg.ds_max = n;
            } else {
                return Err(invalid());
            }
        }

        if cfg.vlan_access.is_some() && (!cfg.vlan_trunk.is_empty() || cfg.vlan_trunk_all) {
            warn!(target: "port", "port cannot be access and trunk simultaneously");
            return Err(FactoryError::InvalidOption("vlan".into()));
        }

        Ok(cfg)
    }

    fn role(&self) -> PortRole {
        if self.monitor {
            if self.vlan_access.is_some() {
                warn!(target: "port", "vlan=access=<id> ignored on monitor ports");
            }
            if self.vlan_trunk_all || !self.vlan_trunk.is_empty() {
                warn!(target: "port", "vlan=trunk=... ignored on monitor ports");
            }
            PortRole::Monitor
        } else if let Some(vid) = self.vlan_access {
            PortRole::Access(vid)
        } else if self.vlan_trunk_all {
            PortRole::Trunk(TrunkSet::All)
        } else if !self.vlan_trunk.is_empty() {
            PortRole::Trunk(TrunkSet::Ids(self.vlan_trunk.iter().copied().collect()))
        } else {
            PortRole::Native
        }
    }
}

/// Builds ports and attaches them to the switch.
pub struct PortFactory {
    vq_max: u16,
    assign_mac: bool,
    trusted_dataspaces: Vec<DataspaceId>,
}

impl PortFactory {
    pub fn new(vq_max: u16, assign_mac: bool, trusted_dataspaces: Vec<DataspaceId>) -> Self {
        PortFactory {
            vq_max,
            assign_mac,
            trusted_dataspaces,
        }
    }

    /// Handle one create request; on success the port is attached and
    /// its id returned (`None` for the monitor).
    pub fn create(
        &self,
        switch: &mut VirtioSwitch,
        opts: &[&str],
    ) -> Result<Option<PortId>, FactoryError> {
        let cfg = PortConfig::parse(opts.iter().copied())?;

        let port_num = switch
            .port_available(cfg.monitor)
            .ok_or(AddPortError::SlotExhausted)?;

        let mut name = cfg.name.clone().unwrap_or_default();
        if name.is_empty() && cfg.monitor {
            name.push_str("monitor");
        }
        if name.len() > NAME_MAX {
            let mut end = NAME_MAX;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name.truncate(end);
        }
        name.push_str(&format!("[{port_num}]"));

        // Default MACs are locally administered, with the port number
        // in the last octets; the monitor gets a recognizable one.
        let mac = match cfg.mac {
            Some(mac) => Some(mac),
            None if self.assign_mac => {
                let tail: [u8; 2] = if cfg.monitor {
                    [0xde, 0xad]
                } else {
                    [(port_num >> 8) as u8, port_num as u8]
                };
                Some(MacAddr::from_bytes(&[
                    0x02, 0x08, 0x0f, 0x2a, tail[0], tail[1],
                ]))
            }
            None => None,
        };

        info!(target: "port", name, monitor = cfg.monitor, "creating port");

        let mut port = VirtioPort::new(name, cfg.role(), self.vq_max, cfg.ds_max, mac)?;
        if !self.trusted_dataspaces.is_empty() {
            port.dev_mut()
                .set_trusted_dataspaces(self.trusted_dataspaces.clone());
        }

        if cfg.monitor {
            switch.add_monitor_port(SwitchPort::Virtio(port))?;
            Ok(None)
        } else {
            let id = switch.add_port(SwitchPort::Virtio(port))?;
            Ok(Some(id))
        }
    }
}
