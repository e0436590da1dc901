//! Schedule activation/deactivation, cadence 60 s.
//!
//! Evaluates every enabled schedule's predicate, activates newly-active
//! ones, deactivates ones that stopped matching, and restores whatever
//! `PreScheduleState` each device had before its schedule first claimed it.
//! Runs the adaptive controller last.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use anyhow::Result;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use hg_api_types::{PreScheduleState, Quota, RepeatMode, RuleType, Schedule};
use log::{info, warn};

use crate::adaptive;
use crate::policy::GovernorState;

/// Evaluates every schedule against `(date, time, weekday)` and drives
/// activation/deactivation, then hands off to the adaptive controller.
pub async fn tick(state: &mut GovernorState, now_date: NaiveDate, now_time: NaiveTime, now_unix: i64) -> Result<()> {
    let mut active_this_cycle: HashSet<i64> = HashSet::new();

    // Ascending id order: the first schedule to claim a device in a given
    // cycle keeps it; a later schedule that also matches does not preempt
    // it (see DESIGN.md's Open Question decisions).
    let mut schedules = state.schedules.clone();
    schedules.sort_by_key(|s| s.id);

    for schedule in &schedules {
        if !schedule.is_enabled {
            continue;
        }
        let Some(should_be_active) = evaluate(schedule, now_date, now_time) else {
            warn!("scheduler: schedule {} has invalid fields, skipping", schedule.id);
            continue;
        };

        let currently_active = state.active_schedule_by_device.get(&schedule.device_ip).copied();
        if should_be_active {
            active_this_cycle.insert(schedule.id);
            if currently_active.is_none() {
                activate(state, schedule, now_unix).await?;
            }
        } else if currently_active == Some(schedule.id) {
            deactivate(state, schedule.device_ip).await?;
        }
    }

    let naturally_ended: Vec<(Ipv4Addr, i64)> = state
        .active_schedule_by_device
        .iter()
        .filter(|(_, id)| !active_this_cycle.contains(id))
        .map(|(ip, id)| (*ip, *id))
        .collect();
    for (ip, _id) in naturally_ended {
        deactivate(state, ip).await?;
    }

    adaptive::tick(state, now_unix).await?;
    Ok(())
}

/// Whether `schedule`'s predicate (date window, repeat mode, wall-clock
/// window) matches `(date, time)`. Returns `None` for a schedule with
/// contradictory fields (e.g. `Once` repeat with no `start_date`) — the
/// caller logs and skips it.
fn evaluate(schedule: &Schedule, date: NaiveDate, time: NaiveTime) -> Option<bool> {
    let date_active = schedule.start_date.map(|d| date >= d).unwrap_or(true) && schedule.end_date.map(|d| date <= d).unwrap_or(true);
    if !date_active {
        return Some(false);
    }
    let time_active = schedule.time_active(time);

    let repeat_active = match schedule.repeat_mode {
        RepeatMode::Once => {
            let start = schedule.start_date?;
            date == start
        }
        RepeatMode::Daily => true,
        RepeatMode::Weekdays => !matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
        RepeatMode::Weekends => matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
        RepeatMode::Custom { days } => {
            // Sunday = 0 .. Saturday = 6.
            let idx = date.weekday().num_days_from_sunday() as usize;
            days[idx]
        }
    };

    Some(date_active && time_active && repeat_active)
}

async fn activate(state: &mut GovernorState, schedule: &Schedule, now_unix: i64) -> Result<()> {
    let ip = schedule.device_ip;
    info!("scheduler: activating schedule {} ('{}') for {ip}", schedule.id, schedule.name);

    if !state.pre_schedule_state.contains_key(&ip) {
        let captured = if let Some(limit) = state.manual_limits.get(&ip).copied() {
            PreScheduleState::Limit(limit)
        } else if let Some(quota) = state.quotas.get(&ip).copied() {
            PreScheduleState::Quota(quota)
        } else {
            PreScheduleState::None
        };
        state.pre_schedule_state.insert(ip, captured);
    }

    if state.adaptive_set.remove(&ip) {
        info!("scheduler: schedule {} overriding adaptive fair-use limit for {ip}", schedule.id);
    }

    match schedule.rule {
        RuleType::Limit { download_kbps, upload_kbps, priority } => {
            state.shaper.add_device_limit(ip, download_kbps, upload_kbps, priority).await?;
        }
        RuleType::Quota { limit_dl_bytes, limit_ul_bytes, period_seconds } => {
            let period = period_seconds.unwrap_or_else(RuleType::default_quota_period_seconds);
            let quota = Quota {
                limit_dl_bytes,
                limit_ul_bytes,
                period_seconds: period,
                start_time: now_unix,
                used_dl_bytes: 0,
                used_ul_bytes: 0,
                is_throttled: false,
            };
            state.store.save_quota(ip, &quota)?;
            state.quotas.insert(ip, quota);
            state.last_raw.remove(&ip);
        }
    }

    state.active_schedule_by_device.insert(ip, schedule.id);
    Ok(())
}

/// Restores `ip`'s captured `PreScheduleState`. Deactivation never
/// reinvokes the adaptive controller directly — the caller (`tick`) already
/// runs it once at the end of the pass, matching the original's later fix
/// that removed a redundant per-device adaptive call here.
pub(crate) async fn deactivate(state: &mut GovernorState, ip: Ipv4Addr) -> Result<()> {
    info!("scheduler: deactivating schedule for {ip}");
    state.active_schedule_by_device.remove(&ip);

    match state.pre_schedule_state.remove(&ip) {
        Some(PreScheduleState::Limit(limit)) => {
            state.shaper.add_device_limit(ip, limit.download_kbps, limit.upload_kbps, limit.priority).await?;
            state.quotas.remove(&ip);
            state.store.delete_quota(ip)?;
        }
        Some(PreScheduleState::Quota(quota)) => {
            state.store.save_quota(ip, &quota)?;
            state.quotas.insert(ip, quota);
            state.last_raw.remove(&ip);
        }
        Some(PreScheduleState::None) | None => {
            state.quotas.remove(&ip);
            state.store.delete_quota(ip)?;
            state.shaper.remove_device_limit(ip).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hg_api_types::ManualLimit;
    use hg_config::Store;
    use hg_net::{FakeShell, ShellExecutor};

    fn test_state() -> GovernorState {
        let shell: Arc<dyn ShellExecutor> = Arc::new(FakeShell::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        GovernorState::load(crate::config::DaemonConfig::default(), store, shell).unwrap()
    }

    fn limit_schedule(id: i64, ip: &str, start: NaiveTime, end: NaiveTime) -> Schedule {
        Schedule {
            id,
            name: "test".to_string(),
            device_ip: ip.parse().unwrap(),
            rule: RuleType::Limit { download_kbps: 128, upload_kbps: 64, priority: 7 },
            start_date: None,
            end_date: None,
            start_time: start,
            end_time: end,
            repeat_mode: RepeatMode::Daily,
            is_enabled: true,
        }
    }

    #[tokio::test]
    async fn activation_preserves_and_restores_manual_limit() {
        let mut state = test_state();
        let ip: Ipv4Addr = "192.168.12.50".parse().unwrap();
        state.manual_limits.insert(ip, ManualLimit { download_kbps: 1024, upload_kbps: 256, priority: 5 });

        let schedule = limit_schedule(1, "192.168.12.50", NaiveTime::from_hms_opt(0, 0, 0).unwrap(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        state.schedules = vec![schedule.clone()];

        let today = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        tick(&mut state, today, NaiveTime::from_hms_opt(12, 0, 0).unwrap(), 1_700_000_000).await.unwrap();
        assert_eq!(state.active_schedule_by_device.get(&ip), Some(&1));
        assert!(matches!(state.pre_schedule_state.get(&ip), Some(PreScheduleState::Limit(_))));

        state.schedules[0].is_enabled = false;
        tick(&mut state, today, NaiveTime::from_hms_opt(12, 0, 1).unwrap(), 1_700_000_060).await.unwrap();
        assert!(state.active_schedule_by_device.get(&ip).is_none());
        assert!(state.pre_schedule_state.get(&ip).is_none());
    }

    #[tokio::test]
    async fn first_active_schedule_is_not_preempted() {
        let mut state = test_state();
        let ip: Ipv4Addr = "192.168.12.51".parse().unwrap();
        let a = limit_schedule(1, "192.168.12.51", NaiveTime::from_hms_opt(0, 0, 0).unwrap(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        let mut b = limit_schedule(2, "192.168.12.51", NaiveTime::from_hms_opt(0, 0, 0).unwrap(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        b.rule = RuleType::Limit { download_kbps: 1, upload_kbps: 1, priority: 0 };
        state.schedules = vec![a, b];

        let today = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        tick(&mut state, today, NaiveTime::from_hms_opt(12, 0, 0).unwrap(), 1_700_000_000).await.unwrap();
        assert_eq!(state.active_schedule_by_device.get(&ip), Some(&1));
    }

    #[test]
    fn wrap_over_midnight_window() {
        let schedule = limit_schedule(1, "192.168.12.50", NaiveTime::from_hms_opt(22, 0, 0).unwrap(), NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert_eq!(evaluate(&schedule, date, NaiveTime::from_hms_opt(23, 0, 0).unwrap()), Some(true));
        assert_eq!(evaluate(&schedule, date, NaiveTime::from_hms_opt(3, 0, 0).unwrap()), Some(true));
        assert_eq!(evaluate(&schedule, date, NaiveTime::from_hms_opt(12, 0, 0).unwrap()), Some(false));
    }

    #[test]
    fn once_repeat_requires_start_date() {
        let mut schedule = limit_schedule(1, "192.168.12.50", NaiveTime::from_hms_opt(0, 0, 0).unwrap(), NaiveTime::from_hms_opt(1, 0, 0).unwrap());
        schedule.repeat_mode = RepeatMode::Once;
        schedule.start_date = None;
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert_eq!(evaluate(&schedule, date, NaiveTime::from_hms_opt(0, 30, 0).unwrap()), None);
    }
}
