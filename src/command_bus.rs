//! Command dispatch.
//!
//! One function per row of the command table: validate, persist, apply to
//! the kernel via the shaper/firewall, mutate memory, reply to the sender,
//! and (for state-changing commands) broadcast the updated list. Mirrors
//! `web_daemon.py::command_listener`'s per-branch
//! validate-then-persist-then-apply-then-notify order.

use anyhow::Result;
use hg_api_types::{AccessControlMode, Command, CommandResult, ManualLimit, MacList, Quota, Schedule};
use log::{info, warn};

use crate::broadcast::Broadcaster;
use crate::policy::GovernorState;
use crate::quota;
use crate::scheduler;

pub async fn dispatch(state: &mut GovernorState, broadcaster: &Broadcaster, command: Command, now_unix: i64) -> CommandResult {
    match handle(state, broadcaster, command, now_unix).await {
        Ok(result) => result,
        Err(e) => {
            warn!("command_bus: {e}");
            CommandResult::Error { message: e.to_string() }
        }
    }
}

async fn handle(state: &mut GovernorState, broadcaster: &Broadcaster, command: Command, now_unix: i64) -> Result<CommandResult> {
    match command {
        Command::Toggle { on } => toggle(state, on).await,
        Command::SetSettings { ssid, password } => set_settings(state, ssid, password),
        Command::SetLimit { ip, download_kbps, upload_kbps, priority } => set_limit(state, ip, download_kbps, upload_kbps, priority).await,
        Command::RemoveLimit { ip } => remove_limit(state, ip).await,
        Command::SetQuota { ip, limit_dl_bytes, limit_ul_bytes, period_seconds } => {
            set_quota(state, ip, limit_dl_bytes, limit_ul_bytes, period_seconds, now_unix).await
        }
        Command::RemoveQuota { ip } => remove_quota(state, ip).await,
        Command::SaveSchedule { id, name, device_ip, rule, start_date, end_date, start_time, end_time, repeat_mode, is_enabled } => {
            save_schedule(state, broadcaster, id, name, device_ip, rule, start_date, end_date, start_time, end_time, repeat_mode, is_enabled, now_unix).await
        }
        Command::DeleteSchedule { id } => delete_schedule(state, broadcaster, id, now_unix).await,
        Command::ToggleSchedule { id, enabled } => toggle_schedule(state, broadcaster, id, enabled, now_unix).await,
        Command::SetClientIsolation { enabled } => set_client_isolation(state, enabled).await,
        Command::SetAccessControlMode { mode } => set_ac_mode(state, mode).await,
        Command::AddMac { mac, list } => add_mac(state, mac, list).await,
        Command::RemoveMac { mac, list } => remove_mac(state, mac, list).await,
        Command::AddIpBlock { range } => add_ip_block(state, range).await,
        Command::RemoveIpBlock { range } => remove_ip_block(state, range).await,
        Command::RequestSecurityState => request_security_state(state),
        Command::RequestForecast => request_forecast(state, now_unix),
    }
}

fn ok(msg: impl Into<String>) -> Result<CommandResult> {
    info!("command_bus: {}", msg.into());
    Ok(CommandResult::Ok)
}

async fn toggle(state: &mut GovernorState, on: bool) -> Result<CommandResult> {
    if on {
        state.firewall.setup().await?;
        let dl = state.capacity.available_download_kbps.max(state.config.default_capacity_download_kbps) as u32;
        let ul = state.capacity.available_upload_kbps.max(state.config.default_capacity_upload_kbps) as u32;
        state.shaper.ensure_root_qdisc(dl, ul).await?;
        for (ip, limit) in state.manual_limits.clone() {
            info!("toggle: re-applying stored limit for {ip}");
            state.shaper.add_device_limit(ip, limit.download_kbps, limit.upload_kbps, limit.priority).await?;
        }
        state.hotspot_up = true;
    } else {
        state.shaper.cleanup().await;
        state.firewall.cleanup().await;
        state.hotspot_up = false;
    }
    state.store.set_bool_setting("hotspot_up", state.hotspot_up)?;
    ok(format!("hotspot toggled {}", if on { "on" } else { "off" }))
}

fn set_settings(state: &mut GovernorState, ssid: String, password: String) -> Result<CommandResult> {
    if state.hotspot_up {
        return Ok(CommandResult::Error { message: "hotspot must be down to change settings".to_string() });
    }
    state.store.set_setting("ssid", &ssid)?;
    state.store.set_setting("password", &password)?;
    ok("settings saved")
}

async fn set_limit(state: &mut GovernorState, ip: std::net::IpAddr, download_kbps: u32, upload_kbps: u32, priority: u8) -> Result<CommandResult> {
    let std::net::IpAddr::V4(ip4) = ip else {
        return Ok(CommandResult::Error { message: "only IPv4 devices can be rate-limited".to_string() });
    };
    if priority > 7 {
        return Ok(CommandResult::Error { message: "priority must be 0..=7".to_string() });
    }
    state.apply_manual_limit(ip4, ManualLimit { download_kbps, upload_kbps, priority }).await?;
    ok(format!("limit set for {ip4}"))
}

async fn remove_limit(state: &mut GovernorState, ip: std::net::IpAddr) -> Result<CommandResult> {
    let std::net::IpAddr::V4(ip4) = ip else {
        return Ok(CommandResult::Error { message: "only IPv4 devices carry a manual limit".to_string() });
    };
    state.remove_manual_limit(ip4).await?;
    ok(format!("limit removed for {ip4}"))
}

async fn set_quota(
    state: &mut GovernorState,
    ip: std::net::IpAddr,
    limit_dl_bytes: u64,
    limit_ul_bytes: u64,
    period_seconds: u64,
    now_unix: i64,
) -> Result<CommandResult> {
    let std::net::IpAddr::V4(ip4) = ip else {
        return Ok(CommandResult::Error { message: "only IPv4 devices carry a quota".to_string() });
    };
    if limit_dl_bytes == 0 || limit_ul_bytes == 0 || period_seconds == 0 {
        return Ok(CommandResult::Error { message: "quota limits and period must be positive".to_string() });
    }

    state.restore_baseline(ip4).await?;

    let new_quota = Quota {
        limit_dl_bytes,
        limit_ul_bytes,
        period_seconds,
        start_time: now_unix,
        used_dl_bytes: 0,
        used_ul_bytes: 0,
        is_throttled: false,
    };
    state.store.save_quota(ip4, &new_quota)?;
    state.quotas.insert(ip4, new_quota);
    state.last_raw.remove(&ip4);
    ok(format!("quota set for {ip4}"))
}

async fn remove_quota(state: &mut GovernorState, ip: std::net::IpAddr) -> Result<CommandResult> {
    let std::net::IpAddr::V4(ip4) = ip else {
        return Ok(CommandResult::Error { message: "only IPv4 devices carry a quota".to_string() });
    };
    quota::remove(state, ip4).await?;
    ok(format!("quota removed for {ip4}"))
}

#[allow(clippy::too_many_arguments)]
async fn save_schedule(
    state: &mut GovernorState,
    broadcaster: &Broadcaster,
    id: Option<i64>,
    name: String,
    device_ip: std::net::Ipv4Addr,
    rule: hg_api_types::RuleType,
    start_date: Option<chrono::NaiveDate>,
    end_date: Option<chrono::NaiveDate>,
    start_time: chrono::NaiveTime,
    end_time: chrono::NaiveTime,
    repeat_mode: hg_api_types::RepeatMode,
    is_enabled: bool,
    now_unix: i64,
) -> Result<CommandResult> {
    let schedule = Schedule {
        id: id.unwrap_or(0),
        name,
        device_ip,
        rule,
        start_date,
        end_date,
        start_time,
        end_time,
        repeat_mode,
        is_enabled,
    };
    let saved_id = state.store.save_schedule(&schedule)?;
    let mut saved = schedule;
    saved.id = saved_id;

    if let Some(existing) = state.schedules.iter_mut().find(|s| s.id == saved_id) {
        *existing = saved;
    } else {
        state.schedules.push(saved);
    }

    reevaluate_schedules(state, now_unix).await?;
    broadcaster.send(hg_api_types::Message::SchedulesUpdate { schedules: state.schedules.clone() });
    ok(format!("schedule {saved_id} saved"))
}

async fn delete_schedule(state: &mut GovernorState, broadcaster: &Broadcaster, id: i64, now_unix: i64) -> Result<CommandResult> {
    let Some(schedule) = state.schedules.iter().find(|s| s.id == id).cloned() else {
        return Ok(CommandResult::Error { message: format!("unknown schedule id {id}") });
    };
    if state.active_schedule_by_device.get(&schedule.device_ip) == Some(&id) {
        deactivate_single(state, schedule.device_ip).await?;
    }
    state.store.delete_schedule(id)?;
    state.schedules.retain(|s| s.id != id);
    broadcaster.send(hg_api_types::Message::SchedulesUpdate { schedules: state.schedules.clone() });
    let _ = now_unix;
    ok(format!("schedule {id} deleted"))
}

async fn toggle_schedule(state: &mut GovernorState, broadcaster: &Broadcaster, id: i64, enabled: bool, now_unix: i64) -> Result<CommandResult> {
    if !state.schedules.iter().any(|s| s.id == id) {
        return Ok(CommandResult::Error { message: format!("unknown schedule id {id}") });
    }
    state.store.set_schedule_enabled(id, enabled)?;
    if let Some(schedule) = state.schedules.iter_mut().find(|s| s.id == id) {
        schedule.is_enabled = enabled;
    }
    reevaluate_schedules(state, now_unix).await?;
    broadcaster.send(hg_api_types::Message::SchedulesUpdate { schedules: state.schedules.clone() });
    ok(format!("schedule {id} {}", if enabled { "enabled" } else { "disabled" }))
}

/// Re-runs the scheduler immediately after a schedule mutation so the new
/// rule takes effect without waiting for the next 60 s tick.
async fn reevaluate_schedules(state: &mut GovernorState, now_unix: i64) -> Result<()> {
    let now = chrono::DateTime::from_timestamp(now_unix, 0).unwrap_or_default();
    scheduler::tick(state, now.date_naive(), now.time(), now_unix).await
}

/// Deactivation helper used by `delete_schedule` outside the scheduler's own
/// pass (the schedule is about to be deleted, so the normal `tick` loop
/// can't see it to deactivate naturally).
async fn deactivate_single(state: &mut GovernorState, ip: std::net::Ipv4Addr) -> Result<()> {
    state.active_schedule_by_device.remove(&ip);
    match state.pre_schedule_state.remove(&ip) {
        Some(hg_api_types::PreScheduleState::Limit(limit)) => {
            state.shaper.add_device_limit(ip, limit.download_kbps, limit.upload_kbps, limit.priority).await?;
            state.quotas.remove(&ip);
            state.store.delete_quota(ip)?;
        }
        Some(hg_api_types::PreScheduleState::Quota(q)) => {
            state.store.save_quota(ip, &q)?;
            state.quotas.insert(ip, q);
            state.last_raw.remove(&ip);
        }
        Some(hg_api_types::PreScheduleState::None) | None => {
            state.quotas.remove(&ip);
            state.store.delete_quota(ip)?;
            state.shaper.remove_device_limit(ip).await?;
        }
    }
    Ok(())
}

async fn set_client_isolation(state: &mut GovernorState, enabled: bool) -> Result<CommandResult> {
    state.store.set_bool_setting("client_isolation", enabled)?;
    state.client_isolation = enabled;
    state.firewall.apply_client_isolation(enabled).await;
    ok(format!("client isolation {}", if enabled { "enabled" } else { "disabled" }))
}

async fn set_ac_mode(state: &mut GovernorState, mode: AccessControlMode) -> Result<CommandResult> {
    state.store.set_access_control_mode(mode)?;
    state.access_control.mode = mode;
    reapply_acl(state).await;
    ok("access control mode changed")
}

async fn add_mac(state: &mut GovernorState, mac: String, list: MacList) -> Result<CommandResult> {
    let tag = match list {
        MacList::Blocked => "block",
        MacList::Allowed => "allow",
    };
    state.store.add_mac(&mac, tag)?;
    match list {
        MacList::Blocked => {
            state.access_control.allowed.remove(&mac);
            state.access_control.blocked.insert(mac.clone());
        }
        MacList::Allowed => {
            state.access_control.blocked.remove(&mac);
            state.access_control.allowed.insert(mac.clone());
        }
    }
    reapply_acl(state).await;
    ok(format!("mac {mac} added to {tag} list"))
}

async fn remove_mac(state: &mut GovernorState, mac: String, list: MacList) -> Result<CommandResult> {
    state.store.remove_mac(&mac)?;
    match list {
        MacList::Blocked => {
            state.access_control.blocked.remove(&mac);
        }
        MacList::Allowed => {
            state.access_control.allowed.remove(&mac);
        }
    }
    reapply_acl(state).await;
    ok(format!("mac {mac} removed"))
}

async fn reapply_acl(state: &GovernorState) {
    let blocked: Vec<String> = state.access_control.blocked.iter().cloned().collect();
    let allowed: Vec<String> = state.access_control.allowed.iter().cloned().collect();
    state.firewall.apply_access_control(state.access_control.mode, &blocked, &allowed).await;
}

async fn add_ip_block(state: &mut GovernorState, range: String) -> Result<CommandResult> {
    if range.parse::<cidr::IpInet>().is_err() && range.parse::<std::net::IpAddr>().is_err() {
        return Ok(CommandResult::Error { message: format!("{range} is not a valid IPv4/IPv6 address or CIDR range") });
    }
    state.store.add_ip_block(&range)?;
    if !state.ip_block_list.contains(&range) {
        state.ip_block_list.push(range.clone());
    }
    state.firewall.apply_ip_block_list(&state.ip_block_list).await;
    ok(format!("ip block added: {range}"))
}

async fn remove_ip_block(state: &mut GovernorState, range: String) -> Result<CommandResult> {
    state.store.remove_ip_block(&range)?;
    state.ip_block_list.retain(|r| r != &range);
    state.firewall.apply_ip_block_list(&state.ip_block_list).await;
    ok(format!("ip block removed: {range}"))
}

fn request_security_state(state: &GovernorState) -> Result<CommandResult> {
    let payload = serde_json::to_value(hg_api_types::Message::SecurityStateUpdate {
        access_control: state.access_control.clone(),
        client_isolation: state.client_isolation,
        ip_block_list: state.ip_block_list.clone(),
    })?;
    Ok(CommandResult::Data(payload))
}

fn request_forecast(state: &GovernorState, now_unix: i64) -> Result<CommandResult> {
    let points = state.store.load_forecast(now_unix, now_unix + 3600)?;
    let payload = serde_json::to_value(hg_api_types::Message::ForecastData { points, capacity: state.capacity })?;
    Ok(CommandResult::Data(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hg_config::Store;
    use hg_net::{FakeShell, ShellExecutor};

    fn test_state() -> GovernorState {
        let shell: Arc<dyn ShellExecutor> = Arc::new(FakeShell::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        GovernorState::load(crate::config::DaemonConfig::default(), store, shell).unwrap()
    }

    #[tokio::test]
    async fn set_limit_then_remove_limit_round_trips() {
        let mut state = test_state();
        let broadcaster = Broadcaster::new();
        let ip: std::net::IpAddr = "192.168.12.25".parse().unwrap();

        let result = dispatch(&mut state, &broadcaster, Command::SetLimit { ip, download_kbps: 2048, upload_kbps: 512, priority: 3 }, 1_700_000_000).await;
        assert!(matches!(result, CommandResult::Ok));
        assert!(state.manual_limits.contains_key(&"192.168.12.25".parse().unwrap()));

        let result = dispatch(&mut state, &broadcaster, Command::RemoveLimit { ip }, 1_700_000_000).await;
        assert!(matches!(result, CommandResult::Ok));
        assert!(!state.manual_limits.contains_key(&"192.168.12.25".parse().unwrap()));
    }

    #[tokio::test]
    async fn set_settings_rejected_while_hotspot_up() {
        let mut state = test_state();
        state.hotspot_up = true;
        let broadcaster = Broadcaster::new();
        let result = dispatch(&mut state, &broadcaster, Command::SetSettings { ssid: "x".to_string(), password: "y".to_string() }, 0).await;
        assert!(matches!(result, CommandResult::Error { .. }));
    }

    #[tokio::test]
    async fn ac_mode_flip_round_trips_through_store_and_firewall() {
        let mut state = test_state();
        let broadcaster = Broadcaster::new();
        dispatch(&mut state, &broadcaster, Command::AddMac { mac: "AA:AA:AA:AA:AA:01".to_string(), list: MacList::Blocked }, 0).await;
        dispatch(&mut state, &broadcaster, Command::SetAccessControlMode { mode: AccessControlMode::BlockList }, 0).await;
        assert_eq!(state.access_control.mode, AccessControlMode::BlockList);
        assert!(state.access_control.blocked.contains("AA:AA:AA:AA:AA:01"));
    }

    #[tokio::test]
    async fn ip_block_accepts_v4_and_v6_ranges_and_rejects_garbage() {
        let mut state = test_state();
        let broadcaster = Broadcaster::new();

        let result = dispatch(&mut state, &broadcaster, Command::AddIpBlock { range: "10.0.0.0/8".to_string() }, 0).await;
        assert!(matches!(result, CommandResult::Ok));
        let result = dispatch(&mut state, &broadcaster, Command::AddIpBlock { range: "2001:db8::/32".to_string() }, 0).await;
        assert!(matches!(result, CommandResult::Ok));
        assert_eq!(state.ip_block_list.len(), 2);

        let result = dispatch(&mut state, &broadcaster, Command::AddIpBlock { range: "not-an-address".to_string() }, 0).await;
        assert!(matches!(result, CommandResult::Error { .. }));
        assert_eq!(state.ip_block_list.len(), 2);
    }

    #[tokio::test]
    async fn save_schedule_activates_immediately_when_already_in_window() {
        let mut state = test_state();
        let broadcaster = Broadcaster::new();
        let ip: std::net::Ipv4Addr = "192.168.12.50".parse().unwrap();
        state.manual_limits.insert(ip, ManualLimit { download_kbps: 1024, upload_kbps: 256, priority: 5 });

        // now_unix = 2026-01-05T12:00:00Z
        let now_unix = 1_767_614_400;
        let command = Command::SaveSchedule {
            id: None,
            name: "evening cap".to_string(),
            device_ip: ip,
            rule: hg_api_types::RuleType::Limit { download_kbps: 128, upload_kbps: 64, priority: 7 },
            start_date: None,
            end_date: None,
            start_time: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            end_time: chrono::NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            repeat_mode: hg_api_types::RepeatMode::Daily,
            is_enabled: true,
        };
        let result = dispatch(&mut state, &broadcaster, command, now_unix).await;
        assert!(matches!(result, CommandResult::Ok));
        assert_eq!(state.schedules.len(), 1);
        assert!(state.active_schedule_by_device.contains_key(&ip));
        assert!(matches!(state.pre_schedule_state.get(&ip), Some(hg_api_types::PreScheduleState::Limit(_))));
    }
}
