use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// The daemon's own runtime configuration — network interface names, store
/// location, tick cadences. Policy data (limits, quotas, schedules, access
/// lists, settings) is not here; it lives in the sqlite store (`hg_config`)
/// and is loaded on startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Wireless interface the hotspot runs on; egress side of download shaping.
    pub hotspot_interface: String,
    /// Virtual IFB device used to redirect ingress for upload shaping.
    pub ifb_device: String,
    /// Hotspot network, e.g. `192.168.12.0/24`. Devices outside this network
    /// are not accounted.
    pub network_cidr: String,
    pub db_path: PathBuf,
    pub control_socket_path: PathBuf,
    pub accounting_interval_secs: u64,
    pub scheduler_interval_secs: u64,
    /// Cadence of the `speedtest-cli` capacity probe.
    pub speedtest_interval_secs: u64,
    /// Initial link capacity assumed before the speedtest probe has reported;
    /// also the value restored if the probe goes stale.
    pub default_capacity_download_kbps: f64,
    pub default_capacity_upload_kbps: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            hotspot_interface: "wlan0".to_string(),
            ifb_device: "ifb0".to_string(),
            network_cidr: "192.168.12.0/24".to_string(),
            db_path: PathBuf::from(hg_buildcfg::GOVERNOR_DB_FN),
            control_socket_path: PathBuf::from(hg_buildcfg::GOVERNOR_SOCKET_FN),
            accounting_interval_secs: 1,
            scheduler_interval_secs: 60,
            speedtest_interval_secs: 10 * 60,
            default_capacity_download_kbps: 10_000.0,
            default_capacity_upload_kbps: 2_000.0,
        }
    }
}

impl DaemonConfig {
    /// Loads the TOML file at `path`, falling back to defaults for any key
    /// it omits. A missing file is not an error — the daemon is runnable
    /// with no config file at all, matching `pbs-buildcfg`'s
    /// compiled-in-default philosophy.
    pub fn load(path: &Path) -> Result<DaemonConfig> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).with_context(|| format!("failed to parse {:?}", path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DaemonConfig::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {:?}", path)),
        }
    }
}
