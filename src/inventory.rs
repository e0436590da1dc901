use std::collections::HashMap;
use std::net::Ipv4Addr;

use futures::future::join_all;
use hg_api_types::Device;
use hg_net::{check_device_active, ShellExecutor};
use log::debug;

use crate::policy::Ipv4Network;

/// DHCP lease files checked in order; the first one that exists wins,
/// matching the several candidate paths the distilled source tries.
const LEASE_PATHS: &[&str] = &[
    "/var/lib/misc/dnsmasq.leases",
    "/var/lib/NetworkManager/dnsmasq-wlan0.leases",
    "/tmp/dnsmasq.leases",
];

struct ArpEntry {
    ip: Ipv4Addr,
    mac: Option<String>,
    reachable: bool,
}

fn parse_arp(output: &str) -> Vec<ArpEntry> {
    let mut out = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(ip_field) = fields.first() else { continue };
        let Ok(ip) = ip_field.parse::<Ipv4Addr>() else { continue };
        let mac = fields
            .iter()
            .position(|f| *f == "lladdr")
            .and_then(|i| fields.get(i + 1))
            .map(|s| s.to_string());
        let reachable = matches!(fields.last().copied(), Some("REACHABLE") | Some("STALE") | Some("DELAY") | Some("PROBE"));
        out.push(ArpEntry { ip, mac, reachable });
    }
    out
}

struct LeaseEntry {
    ip: Ipv4Addr,
    mac: String,
    hostname: String,
}

fn parse_dhcp_leases(contents: &str) -> Vec<LeaseEntry> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let Ok(ip) = fields[2].parse::<Ipv4Addr>() else { continue };
        let hostname = if fields[3] == "*" { Device::unknown_hostname() } else { fields[3].to_string() };
        out.push(LeaseEntry { ip, mac: fields[1].to_string(), hostname });
    }
    out
}

async fn read_first_lease_file() -> String {
    for path in LEASE_PATHS {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            return contents;
        }
    }
    String::new()
}

/// Reconciles ARP neighbors with DHCP leases into the active device set,
/// filtered to the hotspot's own `/24` and excluding the hotspot's own
/// address. DHCP wins for MAC and hostname when both sources know a device.
/// Each candidate is probed for reachability in parallel with a 1 s deadline.
pub async fn poll(shell: &dyn ShellExecutor, hotspot_if: &str, network: Ipv4Network) -> HashMap<Ipv4Addr, Device> {
    let arp_out = shell.run(&["ip", "neigh", "show", "dev", hotspot_if]).await;
    let arp = parse_arp(&arp_out.stdout);
    let leases = parse_dhcp_leases(&read_first_lease_file().await);

    let mut merged: HashMap<Ipv4Addr, (Option<String>, Option<String>, bool)> = HashMap::new();
    for entry in arp {
        merged.insert(entry.ip, (entry.mac, None, entry.reachable));
    }
    for lease in leases {
        let slot = merged.entry(lease.ip).or_insert((None, None, false));
        slot.0 = Some(lease.mac);
        slot.1 = Some(lease.hostname);
    }

    let hotspot_ip = network.first_address();
    let candidates: Vec<(Ipv4Addr, Option<String>, Option<String>, bool)> = merged
        .into_iter()
        .filter(|(ip, _)| *ip != hotspot_ip && network.contains(*ip))
        .map(|(ip, (mac, hostname, arp_reachable))| (ip, mac, hostname, arp_reachable))
        .collect();

    let probes = candidates.iter().map(|(ip, ..)| check_device_active(shell, std::net::IpAddr::V4(*ip)));
    let probe_results = join_all(probes).await;

    let mut devices = HashMap::new();
    for ((ip, mac, hostname, arp_reachable), active) in candidates.into_iter().zip(probe_results) {
        debug!("inventory: {ip} mac={mac:?} active={active}");
        devices.insert(
            ip,
            Device {
                ip: std::net::IpAddr::V4(ip),
                mac,
                hostname: hostname.unwrap_or_else(Device::unknown_hostname),
                arp_reachable,
                active,
            },
        );
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arp_neighbor_lines() {
        let output = "192.168.12.25 dev wlan0 lladdr aa:bb:cc:dd:ee:01 REACHABLE\n\
                       192.168.12.26 dev wlan0  FAILED\n";
        let entries = parse_arp(output);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].reachable);
        assert_eq!(entries[0].mac.as_deref(), Some("aa:bb:cc:dd:ee:01"));
        assert!(!entries[1].reachable);
    }

    #[test]
    fn parses_dhcp_lease_lines() {
        let contents = "1700000000 aa:bb:cc:dd:ee:01 192.168.12.25 my-phone *\n\
                         1700000001 aa:bb:cc:dd:ee:02 192.168.12.26 * *\n";
        let leases = parse_dhcp_leases(contents);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].hostname, "my-phone");
        assert_eq!(leases[1].hostname, "Unknown");
    }
}
