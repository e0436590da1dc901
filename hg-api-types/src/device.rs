use std::collections::HashSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A host observed on the hotspot network, identified by its IPv4 address.
///
/// Created on first ARP/DHCP observation, destroyed when absent from both
/// sources for one polling cycle (see `hotspot_governor::inventory`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub ip: IpAddr,
    pub mac: Option<String>,
    /// "Unknown" when DHCP has not supplied one, matching the source convention.
    pub hostname: String,
    pub arp_reachable: bool,
    /// Result of the best-effort reachability probe run alongside the ARP/DHCP merge.
    pub active: bool,
}

impl Device {
    pub fn unknown_hostname() -> String {
        "Unknown".to_string()
    }
}

/// Source-of-truth manual limit for one device. Outlives the shaper's actual
/// class set: restored verbatim after a quota throttle clears or a schedule
/// deactivates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualLimit {
    pub download_kbps: u32,
    pub upload_kbps: u32,
    /// HTB priority, 0 (highest) through 7 (lowest, the catch-all band).
    pub priority: u8,
}

impl ManualLimit {
    /// The hard-cap class the quota engine installs on throttle: `{8,8,priority=0}`.
    pub const THROTTLE: ManualLimit = ManualLimit {
        download_kbps: 8,
        upload_kbps: 8,
        priority: 0,
    };

    /// The blanket class the adaptive controller installs under predicted congestion.
    pub const FAIR_USE: ManualLimit = ManualLimit {
        download_kbps: 1024,
        upload_kbps: 256,
        priority: 7,
    };
}

/// Rolling data quota for one device.
///
/// Invariant: `is_throttled` must equal `used_dl_bytes >= limit_dl_bytes ||
/// used_ul_bytes >= limit_ul_bytes` within one accounting tick (see
/// `hotspot_governor::quota`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quota {
    pub limit_dl_bytes: u64,
    pub limit_ul_bytes: u64,
    pub period_seconds: u64,
    /// Unix timestamp the current period began.
    pub start_time: i64,
    pub used_dl_bytes: u64,
    pub used_ul_bytes: u64,
    pub is_throttled: bool,
}

impl Quota {
    pub fn exceeded(&self) -> bool {
        self.used_dl_bytes >= self.limit_dl_bytes || self.used_ul_bytes >= self.limit_ul_bytes
    }

    pub fn period_expired(&self, now: i64) -> bool {
        now - self.start_time >= self.period_seconds as i64
    }
}

/// Per-IP shaper class identity. One download class on the egress hierarchy,
/// one symmetric upload class on the IFB hierarchy, both keyed by the same id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShaperClass {
    pub class_id: u8,
}

impl ShaperClass {
    /// Filter priority (`pref`) is defined equal to the class id, matching the
    /// convention of using a stable per-IP key as both class and filter identity.
    pub fn filter_pref(&self) -> u32 {
        self.class_id as u32
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessControlMode {
    AllowAll,
    BlockList,
    AllowList,
}

impl Default for AccessControlMode {
    fn default() -> Self {
        AccessControlMode::AllowAll
    }
}

/// MAC-level access control: one mode plus the two membership sets the mode
/// switches between. Both sets are always kept so that toggling `mode` back
/// and forth does not lose membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControl {
    pub mode: AccessControlMode,
    pub blocked: HashSet<String>,
    pub allowed: HashSet<String>,
}

/// One point of the externally-trained usage forecast, consumed read-only by
/// the adaptive controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: i64,
    pub predicted_bytes: f64,
}

/// Aggregate link capacity, refreshed by the external speedtest probe on its
/// own schedule (roughly every 10 minutes).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capacity {
    pub available_download_kbps: f64,
    pub available_upload_kbps: f64,
    pub last_measured_at: i64,
}
