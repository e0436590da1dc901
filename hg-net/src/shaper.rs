use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use hg_api_types::{ShaperClass, CLASS_ID_MAX, CLASS_ID_MIN};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ShaperError;
use crate::shell::ShellExecutor;

/// Matches a `tc -s class show` class header line, capturing the hierarchy
/// (`1` on the egress device, `2` on the IFB) and the class id. Compiled
/// once: `read_counters` re-parses this output every accounting tick.
static CLASS_HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"class htb (\d+):(\d+)").unwrap());
/// Matches the `Sent <bytes> bytes ...` line that follows a class header.
static SENT_BYTES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Sent (\d+) bytes").unwrap());

/// Default catch-all HTB class both hierarchies fall back to when no
/// per-device class matches (the source's `default 9999`).
const DEFAULT_CLASS: u16 = 9999;
/// HTB burst/cburst applied to every class, download and upload alike.
const BURST: &str = "15k";

/// Programs two HTB hierarchies — egress on the hotspot interface for
/// download, ingress-via-IFB-redirect on a virtual device for upload — and
/// reads their class byte counters back.
///
/// All kernel interaction flows through a [`ShellExecutor`]; this struct
/// holds no file descriptors or netlink sockets of its own; it is cheap to
/// construct and cheap to drop.
pub struct TrafficShaper {
    shell: Arc<dyn ShellExecutor>,
    hotspot_if: String,
    ifb_name: String,
    /// ip -> allocated class id, so a collision probe can see what's taken
    /// and so `remove_device_limit` knows what to tear down.
    class_ids: HashMap<Ipv4Addr, u8>,
}

impl TrafficShaper {
    pub fn new(shell: Arc<dyn ShellExecutor>, hotspot_if: impl Into<String>, ifb_name: impl Into<String>) -> Self {
        TrafficShaper {
            shell,
            hotspot_if: hotspot_if.into(),
            ifb_name: ifb_name.into(),
            class_ids: HashMap::new(),
        }
    }

    /// Brings up both HTB hierarchies and the IFB ingress redirect. Safe to
    /// call repeatedly: existing qdiscs/filters are left as-is by `tc`'s own
    /// idempotence (`add` on an existing handle fails harmlessly and is
    /// ignored here, matching the source's fire-and-forget setup calls).
    pub async fn ensure_root_qdisc(&self, total_dl_kbps: u32, total_ul_kbps: u32) -> Result<(), ShaperError> {
        let hotspot_if = self.hotspot_if.clone();
        let ifb = self.ifb_name.clone();

        self.shell
            .run(&["tc", "qdisc", "add", "dev", &hotspot_if, "root", "handle", "1:", "htb", "default", &DEFAULT_CLASS.to_string()])
            .await;
        self.add_root_class(&hotspot_if, "1", total_dl_kbps).await;

        self.shell.run(&["modprobe", "ifb", "numifbs=1"]).await;
        self.shell.run(&["ip", "link", "del", &ifb, "type", "ifb"]).await;
        self.shell.run(&["ip", "link", "add", &ifb, "type", "ifb"]).await;
        self.shell.run(&["ip", "link", "set", "dev", &ifb, "up"]).await;

        self.shell
            .run(&["tc", "qdisc", "add", "dev", &hotspot_if, "handle", "ffff:", "ingress"])
            .await;
        self.shell
            .run(&[
                "tc", "filter", "add", "dev", &hotspot_if, "parent", "ffff:", "protocol", "all", "u32", "match", "u32", "0", "0",
                "action", "mirred", "egress", "redirect", "dev", &ifb,
            ])
            .await;

        self.shell
            .run(&["tc", "qdisc", "add", "dev", &ifb, "root", "handle", "2:", "htb", "default", &DEFAULT_CLASS.to_string()])
            .await;
        self.add_root_class(&ifb, "2", total_ul_kbps).await;

        Ok(())
    }

    async fn add_root_class(&self, dev: &str, handle: &str, total_kbps: u32) {
        let rate = format!("{total_kbps}kbit");
        self.shell
            .run(&[
                "tc", "class", "add", "dev", dev, "parent", &format!("{handle}:"), "classid", &format!("{handle}:1"), "htb", "rate",
                &rate, "ceil", &rate, "burst", BURST,
            ])
            .await;
        self.shell
            .run(&[
                "tc", "class", "add", "dev", dev, "parent", &format!("{handle}:1"), "classid", &format!("{handle}:{DEFAULT_CLASS}"),
                "htb", "rate", "1kbit", "ceil", &rate, "burst", BURST, "prio", "7",
            ])
            .await;
        self.shell
            .run(&[
                "tc", "qdisc", "add", "dev", dev, "parent", &format!("{handle}:{DEFAULT_CLASS}"), "handle", &format!("{DEFAULT_CLASS}:"),
                "sfq", "perturb", "10",
            ])
            .await;
    }

    /// Updates the root rate on both hierarchies, used when measured capacity
    /// changes.
    pub async fn update_root_rate(&self, total_dl_kbps: u32, total_ul_kbps: u32) {
        let rate_dl = format!("{total_dl_kbps}kbit");
        self.shell
            .run(&["tc", "class", "change", "dev", &self.hotspot_if, "parent", "1:", "classid", "1:1", "htb", "rate", &rate_dl, "ceil", &rate_dl])
            .await;
        let rate_ul = format!("{total_ul_kbps}kbit");
        self.shell
            .run(&["tc", "class", "change", "dev", &self.ifb_name, "parent", "2:", "classid", "2:1", "htb", "rate", &rate_ul, "ceil", &rate_ul])
            .await;
    }

    /// Allocates (or returns the existing) class id for `ip`: last octet,
    /// clamped into `[10, 253]`, linear-probed on collision.
    fn allocate_class_id(&mut self, ip: Ipv4Addr) -> u8 {
        if let Some(id) = self.class_ids.get(&ip) {
            return *id;
        }
        let last_octet = ip.octets()[3];
        let mut candidate = if (last_octet as u16) < CLASS_ID_MIN as u16 {
            last_octet + CLASS_ID_MIN
        } else if last_octet > CLASS_ID_MAX {
            CLASS_ID_MAX
        } else {
            last_octet
        };
        let taken: std::collections::HashSet<u8> = self.class_ids.values().copied().collect();
        while taken.contains(&candidate) {
            candidate = if candidate >= CLASS_ID_MAX { CLASS_ID_MIN } else { candidate + 1 };
        }
        self.class_ids.insert(ip, candidate);
        candidate
    }

    /// Installs (or replaces) a per-device limit on both hierarchies. Uses
    /// the add-then-change idiom: `class add` is tried first, and retried as
    /// `class change` if it fails with exit code 2 and stderr mentioning
    /// "File exists" or "RTNETLINK" (the class already exists).
    pub async fn add_device_limit(&mut self, ip: Ipv4Addr, download_kbps: u32, upload_kbps: u32, priority: u8) -> Result<ShaperClass, ShaperError> {
        let class_id = self.allocate_class_id(ip);
        let hotspot_if = self.hotspot_if.clone();
        let ifb = self.ifb_name.clone();

        self.program_class(&hotspot_if, "1", class_id, download_kbps, priority).await?;
        self.shell
            .run(&["tc", "qdisc", "del", "dev", &hotspot_if, "parent", &format!("1:{class_id}")])
            .await;
        self.shell
            .run(&[
                "tc", "qdisc", "add", "dev", &hotspot_if, "parent", &format!("1:{class_id}"), "handle", &format!("{class_id}:"), "sfq",
                "perturb", "10",
            ])
            .await;
        let dst_match = format!("{ip}/32");
        self.shell
            .run(&[
                "tc", "filter", "add", "dev", &hotspot_if, "protocol", "ip", "parent", "1:", "prio", &class_id.to_string(), "u32", "match",
                "ip", "dst", &dst_match, "flowid", &format!("1:{class_id}"),
            ])
            .await;

        let upload_qdisc_handle = class_id as u16 + 1000;
        self.program_class(&ifb, "2", class_id, upload_kbps, priority).await?;
        self.shell
            .run(&["tc", "qdisc", "del", "dev", &ifb, "parent", &format!("2:{class_id}")])
            .await;
        self.shell
            .run(&[
                "tc", "qdisc", "add", "dev", &ifb, "parent", &format!("2:{class_id}"), "handle", &format!("{upload_qdisc_handle}:"), "sfq",
                "perturb", "10",
            ])
            .await;
        let src_match = format!("{ip}/32");
        self.shell
            .run(&[
                "tc", "filter", "add", "dev", &ifb, "protocol", "ip", "parent", "2:", "prio", &class_id.to_string(), "u32", "match", "ip",
                "src", &src_match, "flowid", &format!("2:{class_id}"),
            ])
            .await;

        Ok(ShaperClass { class_id })
    }

    async fn program_class(&self, dev: &str, handle: &str, class_id: u8, kbps: u32, priority: u8) -> Result<(), ShaperError> {
        let rate = format!("{kbps}kbit");
        let classid = format!("{handle}:{class_id}");
        let add = self
            .shell
            .run(&[
                "tc", "class", "add", "dev", dev, "parent", &format!("{handle}:1"), "classid", &classid, "htb", "rate", &rate, "ceil",
                &rate, "burst", BURST, "cburst", BURST, "prio", &priority.to_string(),
            ])
            .await;
        if add.success() {
            return Ok(());
        }
        if add.code == 2 && (add.stderr.contains("File exists") || add.stderr.contains("RTNETLINK")) {
            debug!("class {classid} on {dev} already exists, retrying as change");
            self.shell
                .run(&[
                    "tc", "class", "change", "dev", dev, "parent", &format!("{handle}:1"), "classid", &classid, "htb", "rate", &rate,
                    "ceil", &rate, "burst", BURST, "cburst", BURST, "prio", &priority.to_string(),
                ])
                .await;
            return Ok(());
        }
        warn!("tc class add on {dev} failed: {}", add.stderr);
        Err(ShaperError::CommandFailed("tc class add".to_string(), add.stderr))
    }

    /// Removes a device's filters, classes, and leaf qdiscs from both
    /// hierarchies. Idempotent: deleting an already-absent filter/class is
    /// not treated as an error.
    pub async fn remove_device_limit(&mut self, ip: Ipv4Addr) -> Result<(), ShaperError> {
        let Some(class_id) = self.class_ids.remove(&ip) else {
            return Ok(());
        };
        let hotspot_if = self.hotspot_if.clone();
        let ifb = self.ifb_name.clone();

        self.shell
            .run(&["tc", "filter", "del", "dev", &hotspot_if, "parent", "1:", "prio", &class_id.to_string()])
            .await;
        self.shell
            .run(&["tc", "qdisc", "del", "dev", &hotspot_if, "parent", &format!("1:{class_id}")])
            .await;
        self.shell
            .run(&["tc", "class", "del", "dev", &hotspot_if, "classid", &format!("1:{class_id}")])
            .await;

        self.shell
            .run(&["tc", "filter", "del", "dev", &ifb, "parent", "2:", "prio", &class_id.to_string()])
            .await;
        self.shell
            .run(&["tc", "qdisc", "del", "dev", &ifb, "parent", &format!("2:{class_id}")])
            .await;
        self.shell
            .run(&["tc", "class", "del", "dev", &ifb, "classid", &format!("2:{class_id}")])
            .await;

        Ok(())
    }

    pub fn has_class(&self, ip: Ipv4Addr) -> bool {
        self.class_ids.contains_key(&ip)
    }

    /// Reads cumulative byte counters for every device currently holding a
    /// shaper class. Returns `(rx_bytes, tx_bytes)` keyed by IP; a class id
    /// with no matching line in `tc -s class show` output is simply absent
    /// from the result rather than erroring — counter format drift degrades
    /// gracefully to a zero delta on the caller's side.
    pub async fn read_counters(&self) -> HashMap<Ipv4Addr, (u64, u64)> {
        let mut out: HashMap<Ipv4Addr, (u64, u64)> = HashMap::new();
        let id_to_ip: HashMap<u16, Ipv4Addr> = self.class_ids.iter().map(|(ip, id)| (*id as u16, *ip)).collect();

        let dl_output = self.shell.run(&["tc", "-s", "class", "show", "dev", &self.hotspot_if]).await;
        for (id, bytes) in parse_class_counters(&dl_output.stdout, 1) {
            if let Some(ip) = id_to_ip.get(&id) {
                out.entry(*ip).or_insert((0, 0)).0 = bytes;
            }
        }

        let ul_output = self.shell.run(&["tc", "-s", "class", "show", "dev", &self.ifb_name]).await;
        for (id, bytes) in parse_class_counters(&ul_output.stdout, 2) {
            if let Some(ip) = id_to_ip.get(&id) {
                out.entry(*ip).or_insert((0, 0)).1 = bytes;
            }
        }

        out
    }

    /// Tears down both hierarchies and the IFB device entirely. Idempotent.
    pub async fn cleanup(&mut self) {
        self.shell
            .run(&["tc", "qdisc", "del", "dev", &self.hotspot_if, "root", "handle", "1:", "htb"])
            .await;
        self.shell
            .run(&["tc", "qdisc", "del", "dev", &self.hotspot_if, "handle", "ffff:", "ingress"])
            .await;
        self.shell
            .run(&["tc", "qdisc", "del", "dev", &self.ifb_name, "root", "handle", "2:", "htb"])
            .await;
        self.shell.run(&["ip", "link", "set", "dev", &self.ifb_name, "down"]).await;
        self.shell.run(&["ip", "link", "del", &self.ifb_name, "type", "ifb"]).await;
        self.class_ids.clear();
    }
}

/// Scans `tc -s class show` output for `class htb <hierarchy>:<id>` lines
/// followed somewhere below by a `Sent <n> bytes ...` line, returning the
/// cumulative byte count per class id. Mirrors the positional parsing the
/// governor was distilled from; see the grounding ledger for the tradeoff.
fn parse_class_counters(output: &str, hierarchy: u8) -> Vec<(u16, u64)> {
    let lines: Vec<&str> = output.lines().collect();
    let mut results = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if let Some(caps) = CLASS_HEADER_RE.captures(lines[i]) {
            let Ok(line_hierarchy) = caps[1].parse::<u8>() else {
                i += 1;
                continue;
            };
            if line_hierarchy != hierarchy {
                i += 1;
                continue;
            }
            let id: u16 = match caps[2].parse() {
                Ok(id) => id,
                Err(_) => {
                    i += 1;
                    continue;
                }
            };
            for line in lines.iter().skip(i + 1).take(3) {
                if let Some(sent) = SENT_BYTES_RE.captures(line) {
                    if let Ok(bytes) = sent[1].parse::<u64>() {
                        results.push((id, bytes));
                    }
                    break;
                }
            }
        }
        i += 1;
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_download_class_counters() {
        let output = "\
class htb 1:25 root prio 3 rate 2048Kbit ceil 2048Kbit burst 15Kb cburst 15Kb
 Sent 123456 bytes 800 pkt (dropped 0, overlimits 0 requeues 0)
 rate 0bit 0pps backlog 0b 0p requeues 0
class htb 1:9999 root prio 7 rate 1Kbit ceil 100000Kbit
 Sent 0 bytes 0 pkt (dropped 0, overlimits 0 requeues 0)
";
        let parsed = parse_class_counters(output, 1);
        assert_eq!(parsed, vec![(25, 123456), (9999, 0)]);
    }

    #[test]
    fn class_id_allocation_clamps_and_probes() {
        // last octet 3 -> clamp to 13
        let shell: Arc<dyn ShellExecutor> = Arc::new(FakeShellStub);
        let mut shaper = TrafficShaper::new(shell, "wlan0", "ifb0");
        let id = shaper.allocate_class_id(Ipv4Addr::new(192, 168, 1, 3));
        assert_eq!(id, 13);
        // re-querying the same ip returns the same id
        assert_eq!(shaper.allocate_class_id(Ipv4Addr::new(192, 168, 1, 3)), 13);
        // last octet 254 -> clamp to 253
        let id2 = shaper.allocate_class_id(Ipv4Addr::new(192, 168, 1, 254));
        assert_eq!(id2, 253);
    }

    struct FakeShellStub;

    #[async_trait::async_trait]
    impl ShellExecutor for FakeShellStub {
        async fn run_timeout(&self, _argv: &[&str], _timeout: std::time::Duration) -> crate::shell::CommandOutput {
            crate::shell::CommandOutput::default()
        }
    }
}
