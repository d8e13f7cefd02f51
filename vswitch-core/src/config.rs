//! Process configuration. Built entirely from CLI flags (no config file;
//! `vswitchd`'s `Cli` maps one-to-one onto this struct) — see `spec.md` §6.

use std::net::{Ipv4Addr, SocketAddr};

use crate::mac;

/// Vendor prefix overlaid onto a derived local MAC's low 3 bytes when no
/// explicit `--mac` is given, matching the original implementation's
/// `MAC_VENDOR` constant.
const MAC_VENDOR_PREFIX: [u8; 3] = [0x00, 0x0c, 0x01];

#[derive(Debug, Clone)]
pub struct Config {
    pub interface_name: String,
    pub local_ip: Option<Ipv4Addr>,
    pub mask: u8,
    pub mtu: u16,
    pub local_mac: u64,
    pub local_udp_port: u16,
    pub core_endpoint: SocketAddr,
    pub send_ttl: u8,
    pub enable_p2p: bool,
    pub auto_up: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface_name: "tvs0".to_string(),
            local_ip: None,
            mask: 24,
            mtu: 1400,
            local_mac: derive_local_mac().unwrap_or(mac::ZERO),
            local_udp_port: 9001,
            core_endpoint: "0.0.0.0:0".parse().expect("static addr"),
            send_ttl: 8,
            enable_p2p: true,
            auto_up: true,
            debug: false,
        }
    }
}

/// Reads the first non-loopback interface's MAC from `/sys/class/net` and
/// overlays [`MAC_VENDOR_PREFIX`] onto its low 3 bytes. Returns `None` on
/// any platform or I/O failure; callers fall back to the all-zero MAC and
/// expect the operator to pass `--mac` explicitly in that case.
pub fn derive_local_mac() -> Option<u64> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "lo" {
            continue;
        }
        let addr_path = entry.path().join("address");
        let Ok(contents) = std::fs::read_to_string(&addr_path) else {
            continue;
        };
        if let Some(mut bytes) = parse_sysfs_mac(contents.trim()) {
            bytes[0] = MAC_VENDOR_PREFIX[0];
            bytes[1] = MAC_VENDOR_PREFIX[1];
            bytes[2] = MAC_VENDOR_PREFIX[2];
            return Some(mac::pack(bytes));
        }
    }
    None
}

fn parse_sysfs_mac(s: &str) -> Option<[u8; 6]> {
    let mac = mac::parse(s)?;
    Some(mac::unpack(mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.interface_name, "tvs0");
        assert_eq!(cfg.mtu, 1400);
        assert_eq!(cfg.mask, 24);
        assert_eq!(cfg.local_udp_port, 9001);
        assert_eq!(cfg.send_ttl, 8);
        assert!(cfg.enable_p2p);
        assert!(cfg.auto_up);
        assert!(!cfg.debug);
    }

    #[test]
    fn parse_sysfs_mac_rejects_malformed_string() {
        assert!(parse_sysfs_mac("not-a-mac").is_none());
    }

    #[test]
    fn parse_sysfs_mac_overlays_are_applied_by_caller_not_parser() {
        let bytes = parse_sysfs_mac("aa:bb:cc:dd:ee:ff").expect("valid");
        assert_eq!(bytes, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }
}
