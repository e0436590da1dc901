use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::device::AccessControlMode;
use crate::schedule::{RepeatMode, RuleType};

/// Everything the command bus accepts, inbound over the control socket. One
/// variant per supported control-socket command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Toggle {
        on: bool,
    },
    SetSettings {
        ssid: String,
        password: String,
    },
    SetLimit {
        ip: IpAddr,
        download_kbps: u32,
        upload_kbps: u32,
        priority: u8,
    },
    RemoveLimit {
        ip: IpAddr,
    },
    SetQuota {
        ip: IpAddr,
        limit_dl_bytes: u64,
        limit_ul_bytes: u64,
        period_seconds: u64,
    },
    RemoveQuota {
        ip: IpAddr,
    },
    SaveSchedule {
        id: Option<i64>,
        name: String,
        device_ip: std::net::Ipv4Addr,
        rule: RuleType,
        start_date: Option<chrono::NaiveDate>,
        end_date: Option<chrono::NaiveDate>,
        start_time: chrono::NaiveTime,
        end_time: chrono::NaiveTime,
        repeat_mode: RepeatMode,
        is_enabled: bool,
    },
    DeleteSchedule {
        id: i64,
    },
    ToggleSchedule {
        id: i64,
        enabled: bool,
    },
    SetClientIsolation {
        enabled: bool,
    },
    SetAccessControlMode {
        mode: AccessControlMode,
    },
    AddMac {
        mac: String,
        list: MacList,
    },
    RemoveMac {
        mac: String,
        list: MacList,
    },
    AddIpBlock {
        range: String,
    },
    RemoveIpBlock {
        range: String,
    },
    RequestSecurityState,
    RequestForecast,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MacList {
    Blocked,
    Allowed,
}

/// Reply to the command's sender only (never broadcast). A validation
/// failure is surfaced only to the sender, with no state mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResult {
    Ok,
    /// Carries a read-only reply payload for `request_security_state` /
    /// `request_forecast`.
    Data(serde_json::Value),
    Error { message: String },
}
