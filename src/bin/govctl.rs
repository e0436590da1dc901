//! `govctl` — thin CLI client for `hotspotd`'s control socket.
//!
//! Grounded on `proxmox-backup-manager.rs`'s role (a small CLI that
//! sends one API call per subcommand and prints the reply) but built on
//! `clap` derive instead of `proxmox-router`'s schema-driven
//! "cli" feature, which isn't worth reproducing for a handful of
//! subcommands (see DESIGN.md). Every subcommand maps to exactly one
//! [`Command`] variant and is sent with
//! [`command_socket::send_command`].

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use hg_api_types::{Command, CommandResult, MacList, RepeatMode, RuleType};

use hotspot_governor::server::command_socket;

#[derive(Parser, Debug)]
#[command(name = "govctl", about = "Control client for the hotspot governor daemon")]
struct Args {
    /// Control socket path.
    #[arg(long, default_value = hg_buildcfg::GOVERNOR_SOCKET_FN)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Bring the hotspot up or down.
    Toggle {
        #[arg(long)]
        on: bool,
    },
    /// Change SSID/password. Only accepted while the hotspot is down.
    SetSettings { ssid: String, password: String },
    /// Apply a fixed-rate limit to a device.
    SetLimit {
        ip: IpAddr,
        download_kbps: u32,
        upload_kbps: u32,
        #[arg(default_value_t = 4)]
        priority: u8,
    },
    /// Remove a device's manual limit.
    RemoveLimit { ip: IpAddr },
    /// Create or replace a device's rolling quota.
    SetQuota {
        ip: IpAddr,
        limit_dl_bytes: u64,
        limit_ul_bytes: u64,
        period_seconds: u64,
    },
    /// Delete a device's quota.
    RemoveQuota { ip: IpAddr },
    /// Create or replace a time-bounded rate limit for a device.
    ScheduleLimit {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        device_ip: std::net::Ipv4Addr,
        #[arg(long)]
        download_kbps: u32,
        #[arg(long)]
        upload_kbps: u32,
        #[arg(long, default_value_t = 4)]
        priority: u8,
        #[command(flatten)]
        window: ScheduleWindow,
    },
    /// Create or replace a time-bounded rolling quota for a device.
    ScheduleQuota {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        device_ip: std::net::Ipv4Addr,
        #[arg(long)]
        limit_dl_bytes: u64,
        #[arg(long)]
        limit_ul_bytes: u64,
        /// Defaults to one hour when omitted.
        #[arg(long)]
        period_seconds: Option<u64>,
        #[command(flatten)]
        window: ScheduleWindow,
    },
    /// Delete a schedule by id.
    DeleteSchedule { id: i64 },
    /// Enable or disable a schedule without deleting it.
    ToggleSchedule { id: i64, enabled: bool },
    /// Enable or disable client isolation.
    SetClientIsolation { enabled: bool },
    /// Switch the MAC access-control mode.
    SetAccessControlMode {
        #[arg(value_enum)]
        mode: AccessControlModeArg,
    },
    /// Add a MAC to the blocked or allowed set.
    AddMac {
        mac: String,
        #[arg(value_enum)]
        list: MacListArg,
    },
    /// Remove a MAC from the blocked or allowed set.
    RemoveMac {
        mac: String,
        #[arg(value_enum)]
        list: MacListArg,
    },
    /// Block an IPv4 or IPv6 address/CIDR.
    AddIpBlock { range: String },
    /// Remove a previously blocked address/CIDR.
    RemoveIpBlock { range: String },
    /// Print the current security state (access control, isolation, blocks).
    SecurityState,
    /// Print the loaded usage forecast.
    Forecast,
}

/// Calendar/time/recurrence bounds shared by `schedule-limit` and
/// `schedule-quota`. Dates and times parse in the same `YYYY-MM-DD`/`HH:MM:SS`
/// formats `chrono`'s own `FromStr` impls accept.
#[derive(ClapArgs, Debug)]
struct ScheduleWindow {
    #[arg(long)]
    start_date: Option<chrono::NaiveDate>,
    #[arg(long)]
    end_date: Option<chrono::NaiveDate>,
    #[arg(long)]
    start_time: chrono::NaiveTime,
    #[arg(long)]
    end_time: chrono::NaiveTime,
    #[arg(long, value_enum, default_value_t = RepeatModeArg::Once)]
    repeat: RepeatModeArg,
    /// Only meaningful with `--repeat custom`: comma-separated weekday
    /// indices, Sunday=0 through Saturday=6.
    #[arg(long, value_delimiter = ',')]
    custom_days: Vec<u8>,
    #[arg(long, default_value_t = true)]
    enabled: bool,
}

impl ScheduleWindow {
    fn into_repeat_mode(self) -> Result<RepeatMode> {
        Ok(match self.repeat {
            RepeatModeArg::Once => RepeatMode::Once,
            RepeatModeArg::Daily => RepeatMode::Daily,
            RepeatModeArg::Weekdays => RepeatMode::Weekdays,
            RepeatModeArg::Weekends => RepeatMode::Weekends,
            RepeatModeArg::Custom => {
                let mut days = [false; 7];
                for d in &self.custom_days {
                    match days.get_mut(*d as usize) {
                        Some(slot) => *slot = true,
                        None => bail!("--custom-days index {d} out of range (0-6)"),
                    }
                }
                RepeatMode::Custom { days }
            }
        })
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum RepeatModeArg {
    Once,
    Daily,
    Weekdays,
    Weekends,
    Custom,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum AccessControlModeArg {
    AllowAll,
    BlockList,
    AllowList,
}

impl From<AccessControlModeArg> for hg_api_types::AccessControlMode {
    fn from(v: AccessControlModeArg) -> Self {
        match v {
            AccessControlModeArg::AllowAll => hg_api_types::AccessControlMode::AllowAll,
            AccessControlModeArg::BlockList => hg_api_types::AccessControlMode::BlockList,
            AccessControlModeArg::AllowList => hg_api_types::AccessControlMode::AllowList,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum MacListArg {
    Blocked,
    Allowed,
}

impl From<MacListArg> for MacList {
    fn from(v: MacListArg) -> Self {
        match v {
            MacListArg::Blocked => MacList::Blocked,
            MacListArg::Allowed => MacList::Allowed,
        }
    }
}

fn into_command(cmd: Cmd) -> Result<Command> {
    Ok(match cmd {
        Cmd::Toggle { on } => Command::Toggle { on },
        Cmd::SetSettings { ssid, password } => Command::SetSettings { ssid, password },
        Cmd::SetLimit { ip, download_kbps, upload_kbps, priority } => {
            Command::SetLimit { ip, download_kbps, upload_kbps, priority }
        }
        Cmd::RemoveLimit { ip } => Command::RemoveLimit { ip },
        Cmd::SetQuota { ip, limit_dl_bytes, limit_ul_bytes, period_seconds } => {
            Command::SetQuota { ip, limit_dl_bytes, limit_ul_bytes, period_seconds }
        }
        Cmd::RemoveQuota { ip } => Command::RemoveQuota { ip },
        Cmd::ScheduleLimit { id, name, device_ip, download_kbps, upload_kbps, priority, window } => {
            let enabled = window.enabled;
            let (start_date, end_date, start_time, end_time) = (window.start_date, window.end_date, window.start_time, window.end_time);
            let repeat_mode = window.into_repeat_mode()?;
            Command::SaveSchedule {
                id,
                name,
                device_ip,
                rule: RuleType::Limit { download_kbps, upload_kbps, priority },
                start_date,
                end_date,
                start_time,
                end_time,
                repeat_mode,
                is_enabled: enabled,
            }
        }
        Cmd::ScheduleQuota { id, name, device_ip, limit_dl_bytes, limit_ul_bytes, period_seconds, window } => {
            let enabled = window.enabled;
            let (start_date, end_date, start_time, end_time) = (window.start_date, window.end_date, window.start_time, window.end_time);
            let repeat_mode = window.into_repeat_mode()?;
            Command::SaveSchedule {
                id,
                name,
                device_ip,
                rule: RuleType::Quota { limit_dl_bytes, limit_ul_bytes, period_seconds },
                start_date,
                end_date,
                start_time,
                end_time,
                repeat_mode,
                is_enabled: enabled,
            }
        }
        Cmd::DeleteSchedule { id } => Command::DeleteSchedule { id },
        Cmd::ToggleSchedule { id, enabled } => Command::ToggleSchedule { id, enabled },
        Cmd::SetClientIsolation { enabled } => Command::SetClientIsolation { enabled },
        Cmd::SetAccessControlMode { mode } => Command::SetAccessControlMode { mode: mode.into() },
        Cmd::AddMac { mac, list } => Command::AddMac { mac, list: list.into() },
        Cmd::RemoveMac { mac, list } => Command::RemoveMac { mac, list: list.into() },
        Cmd::AddIpBlock { range } => Command::AddIpBlock { range },
        Cmd::RemoveIpBlock { range } => Command::RemoveIpBlock { range },
        Cmd::SecurityState => Command::RequestSecurityState,
        Cmd::Forecast => Command::RequestForecast,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let command = into_command(args.command)?;

    let result = command_socket::send_command(args.socket, &command).await?;
    match result {
        CommandResult::Ok => {
            println!("ok");
            Ok(())
        }
        CommandResult::Data(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        CommandResult::Error { message } => {
            bail!("{message}");
        }
    }
}
