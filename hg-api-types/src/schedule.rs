use serde::{Deserialize, Serialize};

use crate::device::{ManualLimit, Quota};

/// How a schedule recurs. `Custom`'s seven flags are indexed Sunday=0 through
/// Saturday=6, matching the source's weekday convention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RepeatMode {
    Once,
    Daily,
    Weekdays,
    Weekends,
    Custom { days: [bool; 7] },
}

/// What a schedule installs while active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule_type")]
pub enum RuleType {
    Limit {
        download_kbps: u32,
        upload_kbps: u32,
        priority: u8,
    },
    /// `period_seconds: None` means "default to one hour", per the source's
    /// hardcoded `period_s = 3600` fallback.
    Quota {
        limit_dl_bytes: u64,
        limit_ul_bytes: u64,
        period_seconds: Option<u64>,
    },
}

impl RuleType {
    pub fn default_quota_period_seconds() -> u64 {
        3600
    }
}

/// A time-bounded rule for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    /// Schedules, like every other policy map, are keyed by the device's
    /// IPv4 address — the stable identity used by every other component.
    pub device_ip: std::net::Ipv4Addr,
    pub rule: RuleType,
    /// Inclusive calendar bounds; `None` means unbounded on that side.
    pub start_date: Option<chrono::NaiveDate>,
    pub end_date: Option<chrono::NaiveDate>,
    pub start_time: chrono::NaiveTime,
    pub end_time: chrono::NaiveTime,
    pub repeat_mode: RepeatMode,
    pub is_enabled: bool,
}

impl Schedule {
    /// Whether `[start_time, end_time)` is active at `now`, honoring the
    /// wrap-over-midnight case (`start > end` means "active from start through
    /// midnight and from midnight through end").
    pub fn time_active(&self, now: chrono::NaiveTime) -> bool {
        if self.start_time <= self.end_time {
            now >= self.start_time && now <= self.end_time
        } else {
            now >= self.start_time || now <= self.end_time
        }
    }
}

/// The policy a device had immediately before a schedule first activated on
/// it, captured once per activation and restored verbatim on deactivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PreScheduleState {
    Limit(ManualLimit),
    Quota(Quota),
    None,
}
