//! Selection of the interfaces worth capturing on.

use crate::monitor::error::EnumerationError;
use std::net::IpAddr;

/// Substrings that mark a virtual or software interface, matched
/// case-insensitively against both the system name and the description.
const VIRTUAL_MARKERS: &[&str] = &[
    "vethernet", "veth", "vmnet", "vboxnet", "docker", "virbr", "br-", "vnet", "virtual",
];

/// One network interface as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// OS-level name, the key used to open a capture.
    pub name:        String,
    pub description: String,
    pub addresses:   Vec<IpAddr>,
    /// Set when the OS itself flags the interface as loopback.
    pub os_loopback: bool,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            name:        name.into(),
            description: description.into(),
            addresses,
            os_loopback: false,
        }
    }

    /// Whether this interface should be monitored: not loopback, not
    /// virtual, and carrying at least one address.
    pub fn is_eligible(&self) -> bool {
        let name = self.name.to_lowercase();
        let description = self.description.to_lowercase();

        if self.os_loopback || name.contains("loopback") {
            return false;
        }
        if is_virtual(&name) || is_virtual(&description) {
            return false;
        }
        !self.addresses.is_empty()
    }
}

impl From<pcap::Device> for InterfaceDescriptor {
    fn from(dev: pcap::Device) -> Self {
        Self {
            os_loopback: dev.flags.is_loopback(),
            addresses:   dev.addresses.iter().map(|a| a.addr).collect(),
            description: dev.desc.unwrap_or_default(),
            name:        dev.name,
        }
    }
}

fn is_virtual(lowered: &str) -> bool {
    VIRTUAL_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Keeps the eligible interfaces, preserving enumeration order.
pub fn select_monitorable(all: Vec<InterfaceDescriptor>) -> Vec<InterfaceDescriptor> {
    all.into_iter().filter(InterfaceDescriptor::is_eligible).collect()
}

/// Enumerates interfaces through libpcap and returns the monitorable ones.
///
/// # Errors
/// Returns [`EnumerationError`] if the OS listing call fails.
pub fn list_monitorable_interfaces() -> Result<Vec<InterfaceDescriptor>, EnumerationError> {
    let devices = pcap::Device::list()?;
    Ok(select_monitorable(devices.into_iter().map(InterfaceDescriptor::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> Vec<IpAddr> {
        vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))]
    }

    #[test]
    fn physical_interface_with_address_is_eligible() {
        assert!(InterfaceDescriptor::new("eth0", "Intel Ethernet", addr()).is_eligible());
    }

    #[test]
    fn loopback_by_name_or_flag_is_excluded() {
        let by_name = InterfaceDescriptor::new(
            r"\Device\NPF_Loopback",
            "Adapter for loopback traffic capture",
            addr(),
        );
        assert!(!by_name.is_eligible());

        let mut by_flag = InterfaceDescriptor::new("lo", "", addr());
        by_flag.os_loopback = true;
        assert!(!by_flag.is_eligible());
    }

    #[test]
    fn virtual_markers_match_name_or_description_case_insensitively() {
        for name in ["docker0", "virbr0", "br-1a2b3c", "vmnet8", "vboxnet0", "veth12ab", "vnet3"] {
            assert!(!InterfaceDescriptor::new(name, "", addr()).is_eligible(), "{}", name);
        }

        let hyperv = InterfaceDescriptor::new(
            r"\Device\NPF_{28B33438-DE72-48EF-98F9-8791DFFE27A9}",
            "Hyper-V Virtual Ethernet Adapter",
            addr(),
        );
        assert!(!hyperv.is_eligible());

        let switch = InterfaceDescriptor::new("{ABC}", "vEthernet (Default Switch)", addr());
        assert!(!switch.is_eligible());
    }

    #[test]
    fn interface_without_addresses_is_excluded() {
        assert!(!InterfaceDescriptor::new("any", "Pseudo-device", Vec::new()).is_eligible());
    }

    #[test]
    fn selection_keeps_enumeration_order() {
        let all = vec![
            InterfaceDescriptor::new("wlan0", "", addr()),
            InterfaceDescriptor::new("docker0", "", addr()),
            InterfaceDescriptor::new("eth0", "", addr()),
            InterfaceDescriptor::new("eth1", "", Vec::new()),
        ];
        let names: Vec<_> = select_monitorable(all).into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["wlan0", "eth0"]);
    }
}
