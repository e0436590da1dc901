use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::device::{AccessControl, Capacity, ForecastPoint};
use crate::schedule::Schedule;

/// One row of the per-tick device snapshot broadcast in `network.data.message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRow {
    pub ip: IpAddr,
    pub hostname: String,
    pub mac: Option<String>,
    pub active: bool,
    pub download_speed_bps: f64,
    pub upload_speed_bps: f64,
    pub session_rx_bytes: u64,
    pub session_tx_bytes: u64,
    pub priority: u8,
    pub has_manual_limit: bool,
    pub has_quota: bool,
    pub quota_time_left_seconds: Option<i64>,
    pub quota_status: Option<String>,
    /// Id of whatever schedule currently has this device claimed, or `None`.
    pub active_schedule_id: Option<i64>,
}

/// Outbound envelopes sent to every connected front-end over the broadcast
/// channel. Variant names mirror the wire-level message types the front-end
/// expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    NetworkDataMessage {
        devices: Vec<DeviceRow>,
        total_rx_bps: f64,
        total_tx_bps: f64,
    },
    SchedulesUpdate {
        schedules: Vec<Schedule>,
    },
    DevicesList {
        devices: Vec<DeviceRow>,
    },
    ForecastData {
        points: Vec<ForecastPoint>,
        capacity: Capacity,
    },
    SecurityStateUpdate {
        access_control: AccessControl,
        client_isolation: bool,
        ip_block_list: Vec<String>,
    },
    NotificationMessage {
        text: String,
        is_error: bool,
    },
}
