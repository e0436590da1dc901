//! Per-tick bandwidth accounting, cadence 1 s.
//!
//! Refreshes the device inventory, pulls raw cumulative byte counters from
//! whichever source is authoritative for each device (the shaper if it
//! holds a class for that IP, otherwise the iptables monitoring chain),
//! turns them into deltas, feeds the deltas to the quota engine, logs
//! non-zero deltas, and emits one broadcast snapshot.

use std::net::Ipv4Addr;

use anyhow::Result;
use hg_api_types::DeviceRow;
use log::debug;

use crate::broadcast::Broadcaster;
use crate::policy::GovernorState;
use crate::quota;

/// Runs one accounting tick. `now` is the current unix timestamp (seconds);
/// callers are expected to pass a real clock reading in production and a
/// fixed value in tests.
pub async fn tick(state: &mut GovernorState, broadcaster: &Broadcaster, now: i64) -> Result<()> {
    let fresh = crate::inventory::poll(state.shell.as_ref(), &state.config.hotspot_interface, state.network).await;

    for ip in fresh.keys() {
        if !state.devices.contains_key(ip) {
            debug!("accounting: newly observed device {ip}, adding to monitoring chain");
            state.firewall.add_device_to_monitoring(*ip).await;
        }
    }
    state.devices = fresh;

    let shaped_counters = state.shaper.read_counters().await;
    let monitored_counters = state.firewall.read_monitoring_counters().await;

    let device_ips: Vec<Ipv4Addr> = state.devices.keys().copied().collect();
    let mut rows = Vec::with_capacity(device_ips.len());
    let mut total_rx_bps = 0.0;
    let mut total_tx_bps = 0.0;
    let interval = state.config.accounting_interval_secs.max(1) as f64;
    let timestamp = iso_timestamp(now);

    for ip in device_ips {
        let has_class = state.shaper.has_class(ip);
        let (current_rx, current_tx) = if has_class {
            shaped_counters.get(&ip).copied().unwrap_or((0, 0))
        } else {
            monitored_counters.get(&ip).copied().unwrap_or((0, 0))
        };

        let (last_rx, last_tx) = state.last_raw.get(&ip).copied().unwrap_or((0, 0));
        let rx_delta = if current_rx < last_rx { current_rx } else { current_rx - last_rx };
        let tx_delta = if current_tx < last_tx { current_tx } else { current_tx - last_tx };
        state.last_raw.insert(ip, (current_rx, current_tx));

        let (session_rx, session_tx) = state.session_totals.entry(ip).or_insert((0, 0));
        *session_rx += rx_delta;
        *session_tx += tx_delta;
        let (session_rx, session_tx) = (*session_rx, *session_tx);

        let rx_speed = rx_delta as f64 / interval;
        let tx_speed = tx_delta as f64 / interval;
        total_rx_bps += rx_speed;
        total_tx_bps += tx_speed;

        quota::apply_tick(state, ip, rx_delta, tx_delta, now).await?;

        if rx_delta != 0 || tx_delta != 0 {
            if let Err(e) = state.store.log_usage(&timestamp, &ip.to_string(), rx_delta, tx_delta) {
                log::warn!("accounting: failed to log usage for {ip}: {e}");
            }
        }

        let device = &state.devices[&ip];
        let quota = state.quotas.get(&ip);
        let manual = state.manual_limits.get(&ip);
        rows.push(DeviceRow {
            ip: std::net::IpAddr::V4(ip),
            hostname: device.hostname.clone(),
            mac: device.mac.clone(),
            active: device.active,
            download_speed_bps: rx_speed,
            upload_speed_bps: tx_speed,
            session_rx_bytes: session_rx,
            session_tx_bytes: session_tx,
            priority: manual.map(|l| l.priority).unwrap_or(5),
            has_manual_limit: manual.is_some(),
            has_quota: quota.is_some(),
            quota_time_left_seconds: quota.map(|q| (q.period_seconds as i64 - (now - q.start_time)).max(0)),
            quota_status: quota.map(|q| if q.is_throttled { "throttled".to_string() } else { "ok".to_string() }),
            active_schedule_id: state.active_schedule_by_device.get(&ip).copied(),
        });
    }

    if let Err(e) = state.store.record_usage_summary(&timestamp, total_rx_bps as u64, total_tx_bps as u64) {
        log::warn!("accounting: failed to record usage summary: {e}");
    }

    broadcaster.send_network_data(rows, total_rx_bps, total_tx_bps);
    Ok(())
}

fn iso_timestamp(unix_secs: i64) -> String {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_opt(unix_secs, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| unix_secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hg_config::Store;
    use hg_net::{CommandOutput, FakeShell, ShellExecutor};

    fn test_state() -> GovernorState {
        let shell: Arc<dyn ShellExecutor> = Arc::new(FakeShell::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        GovernorState::load(crate::config::DaemonConfig::default(), store, shell).unwrap()
    }

    #[tokio::test]
    async fn tick_handles_an_empty_network_without_error() {
        let mut state = test_state();
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        tick(&mut state, &broadcaster, 1_700_000_000).await.unwrap();
        let msg = rx.try_recv().unwrap();
        match msg {
            hg_api_types::Message::NetworkDataMessage { devices, .. } => assert!(devices.is_empty()),
            _ => panic!("expected a network data message"),
        }
    }

    #[tokio::test]
    async fn counter_reset_is_treated_as_a_fresh_total() {
        let mut state = test_state();
        let ip: Ipv4Addr = "192.168.12.25".parse().unwrap();
        state.last_raw.insert(ip, (1_000, 0));
        // current < last simulates a counter reset (e.g. class recreated).
        let current = (500u64, 0u64);
        let (last_rx, last_tx) = state.last_raw.get(&ip).copied().unwrap();
        let rx_delta = if current.0 < last_rx { current.0 } else { current.0 - last_rx };
        let tx_delta = if current.1 < last_tx { current.1 } else { current.1 - last_tx };
        assert_eq!(rx_delta, 500);
        assert_eq!(tx_delta, 0);
        let _ = CommandOutput::default();
    }
}
