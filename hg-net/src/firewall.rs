use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use hg_api_types::AccessControlMode;

use crate::error::FirewallError;
use crate::shell::ShellExecutor;

const MONITOR_CHAIN: &str = "hg_monitor";
const IP_BLOCK_CHAIN: &str = "hg_ip_block";
const ISOLATION_CHAIN: &str = "hg_isolation";
const ACL_CHAIN: &str = "hg_acl";

/// Programs the monitoring, IP-block, isolation, and ACL chains on both
/// `iptables` and `ip6tables` (monitoring is IPv4-only), and links them into
/// `FORWARD` in the fixed evaluation order IP-block → isolation → ACL →
/// monitoring.
pub struct FirewallManager {
    shell: Arc<dyn ShellExecutor>,
    hotspot_if: String,
}

impl FirewallManager {
    pub fn new(shell: Arc<dyn ShellExecutor>, hotspot_if: impl Into<String>) -> Self {
        FirewallManager {
            shell,
            hotspot_if: hotspot_if.into(),
        }
    }

    fn bin_for(family_v6: bool) -> &'static str {
        if family_v6 {
            "ip6tables"
        } else {
            "iptables"
        }
    }

    async fn create_chain(&self, bin: &str, chain: &str) {
        self.shell.run(&[bin, "-N", chain]).await;
        self.shell.run(&[bin, "-F", chain]).await;
    }

    /// Removes every reference to `chain` from FORWARD (a chain may be
    /// linked more than once across setup/cleanup cycles), looping until a
    /// delete fails, then flushes and deletes the chain itself. Idempotent.
    async fn unlink_and_delete_chain(&self, bin: &str, chain: &str) {
        loop {
            let out = self.shell.run(&[bin, "-D", "FORWARD", "-j", chain]).await;
            if !out.success() {
                break;
            }
        }
        self.shell.run(&[bin, "-F", chain]).await;
        self.shell.run(&[bin, "-X", chain]).await;
    }

    /// Brings up all chains (both families) and links them into FORWARD in
    /// evaluation order. Call after [`Self::cleanup`] to guarantee a clean
    /// base, or directly on startup.
    pub async fn setup(&self) -> Result<(), FirewallError> {
        self.create_chain("iptables", MONITOR_CHAIN).await;
        for bin in ["iptables", "ip6tables"] {
            self.create_chain(bin, IP_BLOCK_CHAIN).await;
            self.create_chain(bin, ISOLATION_CHAIN).await;
            self.create_chain(bin, ACL_CHAIN).await;
        }

        // Insert each chain at FORWARD position 1, in reverse of the desired
        // evaluation order, so the final top-to-bottom order reads
        // IP-block -> isolation -> ACL -> monitoring.
        self.shell.run(&["iptables", "-I", "FORWARD", "1", "-j", MONITOR_CHAIN]).await;
        for bin in ["iptables", "ip6tables"] {
            self.shell.run(&[bin, "-I", "FORWARD", "1", "-j", ACL_CHAIN]).await;
            self.shell.run(&[bin, "-I", "FORWARD", "1", "-j", ISOLATION_CHAIN]).await;
            self.shell.run(&[bin, "-I", "FORWARD", "1", "-j", IP_BLOCK_CHAIN]).await;
        }

        Ok(())
    }

    /// Tears down every chain and its FORWARD reference, both families.
    /// Idempotent: safe to call on an already-clean table.
    pub async fn cleanup(&self) {
        self.unlink_and_delete_chain("iptables", MONITOR_CHAIN).await;
        for bin in ["iptables", "ip6tables"] {
            self.unlink_and_delete_chain(bin, IP_BLOCK_CHAIN).await;
            self.unlink_and_delete_chain(bin, ISOLATION_CHAIN).await;
            self.unlink_and_delete_chain(bin, ACL_CHAIN).await;
        }
    }

    /// Adds one device to the monitoring chain: two RETURN rules (source and
    /// destination), used purely as byte counters for devices with no active
    /// shaper class. IPv4 only.
    pub async fn add_device_to_monitoring(&self, ip: Ipv4Addr) {
        self.shell
            .run(&["iptables", "-A", MONITOR_CHAIN, "-s", &format!("{ip}/32"), "-j", "RETURN"])
            .await;
        self.shell
            .run(&["iptables", "-A", MONITOR_CHAIN, "-d", &format!("{ip}/32"), "-j", "RETURN"])
            .await;
    }

    /// Reads the monitoring chain's per-rule byte counters via
    /// `iptables -L -v -n -x`, returning `(rx_bytes, tx_bytes)` per IP found
    /// (rx from the destination-matching rule, tx from the source-matching
    /// rule, matching the device's own traffic direction relative to the
    /// hotspot).
    pub async fn read_monitoring_counters(&self) -> std::collections::HashMap<Ipv4Addr, (u64, u64)> {
        let out = self.shell.run(&["iptables", "-L", MONITOR_CHAIN, "-v", "-n", "-x"]).await;
        let mut result: std::collections::HashMap<Ipv4Addr, (u64, u64)> = std::collections::HashMap::new();
        for line in out.stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 9 || !parts[0].chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let bytes: u64 = match parts[1].parse() {
                Ok(b) => b,
                Err(_) => continue,
            };
            let source = parts[7];
            let dest = parts[8];
            if let Ok(ip) = source.trim_end_matches("/32").parse::<Ipv4Addr>() {
                result.entry(ip).or_insert((0, 0)).1 = bytes;
            }
            if let Ok(ip) = dest.trim_end_matches("/32").parse::<Ipv4Addr>() {
                result.entry(ip).or_insert((0, 0)).0 = bytes;
            }
        }
        result
    }

    /// Flushes and reprograms the isolation chain: a single DROP if
    /// `enabled`, empty (fall-through) otherwise. Scoped to
    /// hotspot-to-hotspot traffic only (`-i <if> -o <if>`).
    pub async fn apply_client_isolation(&self, enabled: bool) {
        for bin in ["iptables", "ip6tables"] {
            self.shell.run(&[bin, "-F", ISOLATION_CHAIN]).await;
            if enabled {
                self.shell
                    .run(&[bin, "-A", ISOLATION_CHAIN, "-i", &self.hotspot_if, "-o", &self.hotspot_if, "-j", "DROP"])
                    .await;
            }
        }
    }

    /// Flushes and reprograms the ACL chain per `mode`:
    /// - `allow_all`: empty.
    /// - `block_list`: one DROP per blocked MAC.
    /// - `allow_list`: one ACCEPT per allowed MAC, then a single terminal DROP.
    pub async fn apply_access_control(&self, mode: AccessControlMode, blocked: &[String], allowed: &[String]) {
        for bin in ["iptables", "ip6tables"] {
            self.shell.run(&[bin, "-F", ACL_CHAIN]).await;
            match mode {
                AccessControlMode::AllowAll => {}
                AccessControlMode::BlockList => {
                    for mac in blocked {
                        self.shell
                            .run(&[bin, "-A", ACL_CHAIN, "-m", "mac", "--mac-source", mac, "-j", "DROP"])
                            .await;
                    }
                }
                AccessControlMode::AllowList => {
                    for mac in allowed {
                        self.shell
                            .run(&[bin, "-A", ACL_CHAIN, "-m", "mac", "--mac-source", mac, "-j", "ACCEPT"])
                            .await;
                    }
                    self.shell.run(&[bin, "-A", ACL_CHAIN, "-j", "DROP"]).await;
                }
            }
        }
    }

    /// Flushes and reprograms the IP-block chain: for each entry, one DROP
    /// matching source and one matching destination. Entries containing `:`
    /// go to `ip6tables`, otherwise `iptables`. Deliberately no terminal
    /// ACCEPT — unmatched traffic falls through to the next chain.
    pub async fn apply_ip_block_list(&self, entries: &[String]) {
        for bin in ["iptables", "ip6tables"] {
            self.shell.run(&[bin, "-F", IP_BLOCK_CHAIN]).await;
        }
        for entry in entries {
            let bin = if entry.contains(':') { "ip6tables" } else if entry.contains('.') { "iptables" } else { continue };
            self.shell.run(&[bin, "-A", IP_BLOCK_CHAIN, "-s", entry, "-j", "DROP"]).await;
            self.shell.run(&[bin, "-A", IP_BLOCK_CHAIN, "-d", entry, "-j", "DROP"]).await;
        }
    }

    pub fn hotspot_if(&self) -> &str {
        &self.hotspot_if
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::FakeShell;

    fn manager() -> (FirewallManager, Arc<FakeShell>) {
        let shell = Arc::new(FakeShell::new());
        (FirewallManager::new(shell.clone(), "wlan0"), shell)
    }

    #[tokio::test]
    async fn access_control_mode_flip_reprograms_acl_chain() {
        let (fw, shell) = manager();
        fw.apply_access_control(AccessControlMode::BlockList, &["AA:AA:AA:AA:AA:01".to_string()], &[]).await;
        let calls = shell.calls_matching("iptables");
        assert!(calls.iter().any(|c| c.contains(&"DROP".to_string()) && c.contains(&"AA:AA:AA:AA:AA:01".to_string())));

        fw.apply_access_control(AccessControlMode::AllowList, &[], &["BB:BB:BB:BB:BB:02".to_string()]).await;
        let calls = shell.calls_matching("iptables");
        let acl_calls: Vec<_> = calls.iter().filter(|c| c.contains(&ACL_CHAIN.to_string())).collect();
        assert!(acl_calls.iter().any(|c| c.contains(&"ACCEPT".to_string()) && c.contains(&"BB:BB:BB:BB:BB:02".to_string())));
        assert!(acl_calls.last().unwrap().contains(&"DROP".to_string()));

        fw.apply_access_control(AccessControlMode::AllowAll, &[], &[]).await;
    }

    #[tokio::test]
    async fn ip_block_list_routes_v4_and_v6_to_their_own_chain_with_no_terminal_accept() {
        let (fw, shell) = manager();
        fw.apply_ip_block_list(&["10.0.0.0/8".to_string(), "2001:db8::/32".to_string()]).await;

        let v4 = shell.calls_matching("iptables");
        let v4_block: Vec<_> = v4.iter().filter(|c| c.contains(&IP_BLOCK_CHAIN.to_string()) && c.contains(&"-A".to_string())).collect();
        assert_eq!(v4_block.len(), 2);
        assert!(v4_block.iter().all(|c| c.contains(&"10.0.0.0/8".to_string()) && c.contains(&"DROP".to_string())));
        assert!(!v4_block.iter().any(|c| c.contains(&"ACCEPT".to_string())));

        let v6 = shell.calls_matching("ip6tables");
        let v6_block: Vec<_> = v6.iter().filter(|c| c.contains(&IP_BLOCK_CHAIN.to_string()) && c.contains(&"-A".to_string())).collect();
        assert_eq!(v6_block.len(), 2);
        assert!(v6_block.iter().all(|c| c.contains(&"2001:db8::/32".to_string()) && c.contains(&"DROP".to_string())));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (fw, shell) = manager();
        fw.setup().await.unwrap();
        fw.cleanup().await;
        let calls_after_one = shell.calls().len();
        fw.cleanup().await;
        // a second cleanup issues the same flush/delete calls (minus any
        // FORWARD unlink loop iterations, which already terminated) --
        // calling it twice must not error or grow state.
        assert!(shell.calls().len() >= calls_after_one);
    }

    #[tokio::test]
    async fn client_isolation_toggle() {
        let (fw, shell) = manager();
        fw.apply_client_isolation(true).await;
        assert!(shell.calls_matching("iptables").iter().any(|c| c.contains(&"DROP".to_string())));
        fw.apply_client_isolation(false).await;
        let last_acl_calls: Vec<_> = shell.calls_matching("iptables").into_iter().rev().take(1).collect();
        assert!(last_acl_calls[0].contains(&"-F".to_string()));
    }
}

/// `true` if `ping -c 1 -W 1 <ip>` succeeds. Always `false` for IPv6 (the
/// reachability probe, like accounting, is IPv4-only).
pub async fn check_device_active(shell: &dyn ShellExecutor, ip: IpAddr) -> bool {
    match ip {
        IpAddr::V6(_) => false,
        IpAddr::V4(v4) => {
            let ip_str = v4.to_string();
            let out = shell.run_timeout(&["ping", "-c", "1", "-W", "1", &ip_str], std::time::Duration::from_secs(1)).await;
            out.success()
        }
    }
}
