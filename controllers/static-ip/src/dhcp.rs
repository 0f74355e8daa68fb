//! DHCP mode predicates.

use crds::NetworkDeviceSpec;

/// A device obtains its configuration through DHCP when either family asks for it.
pub fn is_device_dhcp(device: &NetworkDeviceSpec) -> bool {
    device.dhcp4 || device.dhcp6
}

/// An owner is DHCP only when every device is; a single static device makes
/// it mixed-mode. An owner without devices counts as DHCP (nothing to assign).
pub fn is_owner_dhcp(devices: &[NetworkDeviceSpec]) -> bool {
    devices.iter().all(is_device_dhcp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(dhcp4: bool, dhcp6: bool) -> NetworkDeviceSpec {
        NetworkDeviceSpec {
            network_name: "vm-net".to_string(),
            dhcp4,
            dhcp6,
            ..Default::default()
        }
    }

    #[test]
    fn test_device_is_dhcp_if_either_family_is() {
        assert!(is_device_dhcp(&device(true, false)));
        assert!(is_device_dhcp(&device(false, true)));
        assert!(!is_device_dhcp(&device(false, false)));
    }

    #[test]
    fn test_owner_is_dhcp_only_if_every_device_is() {
        assert!(is_owner_dhcp(&[]));
        assert!(is_owner_dhcp(&[device(true, false), device(false, true)]));
        assert!(!is_owner_dhcp(&[device(true, false), device(false, false)]));
        assert!(!is_owner_dhcp(&[device(false, false)]));
    }
}
