//! Forecast-driven fair-use controller, invoked last by the
//! scheduler on every schedule tick.
//!
//! Reads the persisted forecast for the next hour, derives a peak-Kbps
//! congestion ratio against measured capacity, and imposes or lifts a
//! blanket low-priority class on every device that isn't already managed by
//! something else. Adaptive limits never win against a manual limit, an
//! exceeded/throttled quota, or an active schedule — see
//! `hotspot_manager_core.py`'s `apply_adaptive_policy`/`schedule_checker`.

use anyhow::Result;
use hg_api_types::ManualLimit;
use log::{info, warn};

use crate::policy::GovernorState;

/// Forecast aggregation bucket width in seconds (15 minutes, by convention).
const AGGREGATION_SECONDS: f64 = 15.0 * 60.0;
const CONGESTED_THRESHOLD: f64 = 0.85;
const CLEAR_THRESHOLD: f64 = 0.5;
/// Forecast lookahead window for the peak-usage scan.
const LOOKAHEAD_SECONDS: i64 = 3600;

pub async fn tick(state: &mut GovernorState, now: i64) -> Result<()> {
    if state.capacity.available_download_kbps <= 0.0 {
        return Ok(());
    }

    let points = state.store.load_forecast(now, now + LOOKAHEAD_SECONDS)?;
    let Some(peak_bytes) = points.iter().map(|p| p.predicted_bytes).fold(None, |acc, v| {
        Some(match acc {
            Some(max) if max >= v => max,
            _ => v,
        })
    }) else {
        return Ok(());
    };

    let predicted_peak_kbps = (peak_bytes * 8.0) / AGGREGATION_SECONDS / 1000.0;
    let congestion = predicted_peak_kbps / state.capacity.available_download_kbps;
    info!("adaptive: peak predicted {predicted_peak_kbps:.0} kbps, congestion {:.1}%", congestion * 100.0);

    if congestion > CONGESTED_THRESHOLD {
        apply_congested(state).await?;
    } else if congestion < CLEAR_THRESHOLD {
        apply_clear(state).await?;
    }
    Ok(())
}

async fn apply_congested(state: &mut GovernorState) -> Result<()> {
    let candidates: Vec<std::net::Ipv4Addr> = state
        .devices
        .values()
        .filter(|d| d.active)
        .filter_map(|d| match d.ip {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
        .filter(|ip| {
            !state.manual_limits.contains_key(ip)
                && !state.quotas.get(ip).map(|q| q.is_throttled).unwrap_or(false)
                && !state.active_schedule_by_device.contains_key(ip)
        })
        .collect();

    for ip in candidates {
        if !state.adaptive_set.contains(&ip) {
            info!("adaptive: applying fair-use limit to {ip}");
            if let Err(e) = state
                .shaper
                .add_device_limit(ip, ManualLimit::FAIR_USE.download_kbps, ManualLimit::FAIR_USE.upload_kbps, ManualLimit::FAIR_USE.priority)
                .await
            {
                warn!("adaptive: failed to apply fair-use limit to {ip}: {e}");
                continue;
            }
            state.adaptive_set.insert(ip);
        }
    }
    Ok(())
}

async fn apply_clear(state: &mut GovernorState) -> Result<()> {
    if state.adaptive_set.is_empty() {
        return Ok(());
    }
    info!("adaptive: predicted congestion cleared, removing fair-use limits");
    let tracked: Vec<std::net::Ipv4Addr> = state.adaptive_set.iter().copied().collect();
    for ip in tracked {
        let still_unmanaged = !state.manual_limits.contains_key(&ip)
            && !state.active_schedule_by_device.contains_key(&ip)
            && !state.quotas.get(&ip).map(|q| q.is_throttled).unwrap_or(false);
        if still_unmanaged {
            if let Err(e) = state.shaper.remove_device_limit(ip).await {
                warn!("adaptive: failed to remove fair-use limit from {ip}: {e}");
            }
        }
        state.adaptive_set.remove(&ip);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hg_api_types::{Capacity, Device};
    use hg_config::Store;
    use hg_net::{FakeShell, ShellExecutor};

    fn test_state() -> GovernorState {
        let shell: Arc<dyn ShellExecutor> = Arc::new(FakeShell::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut state = GovernorState::load(crate::config::DaemonConfig::default(), store, shell).unwrap();
        state.capacity = Capacity { available_download_kbps: 10_000.0, available_upload_kbps: 2_000.0, last_measured_at: 1_700_000_000 };
        state
    }

    fn insert_device(state: &mut GovernorState, ip: &str) {
        let ip: std::net::Ipv4Addr = ip.parse().unwrap();
        state.devices.insert(
            ip,
            Device { ip: std::net::IpAddr::V4(ip), mac: None, hostname: "dev".to_string(), arp_reachable: true, active: true },
        );
    }

    #[tokio::test]
    async fn low_forecast_does_not_engage_adaptive_limit() {
        let mut state = test_state();
        insert_device(&mut state, "192.168.12.60");
        state.store.save_forecast_point("1700000900", 1.0e7, None, None).unwrap();
        tick(&mut state, 1_700_000_000).await.unwrap();
        assert!(state.adaptive_set.is_empty());
    }

    #[tokio::test]
    async fn high_forecast_engages_unmanaged_devices_only() {
        let mut state = test_state();
        insert_device(&mut state, "192.168.12.60");
        insert_device(&mut state, "192.168.12.61");
        state.manual_limits.insert("192.168.12.61".parse().unwrap(), ManualLimit { download_kbps: 5000, upload_kbps: 1000, priority: 1 });
        state.store.save_forecast_point("1700000900", 1.2e9, None, None).unwrap();
        tick(&mut state, 1_700_000_000).await.unwrap();
        assert!(state.adaptive_set.contains(&"192.168.12.60".parse().unwrap()));
        assert!(!state.adaptive_set.contains(&"192.168.12.61".parse().unwrap()));
    }

    #[tokio::test]
    async fn clearing_congestion_does_not_strip_a_quota_throttle() {
        let mut state = test_state();
        let ip: std::net::Ipv4Addr = "192.168.12.62".parse().unwrap();
        insert_device(&mut state, "192.168.12.62");
        state.adaptive_set.insert(ip);
        // simulate the throttle class quota.rs would have installed
        state.shaper.add_device_limit(ip, ManualLimit::THROTTLE.download_kbps, ManualLimit::THROTTLE.upload_kbps, ManualLimit::THROTTLE.priority).await.unwrap();
        state.quotas.insert(
            ip,
            hg_api_types::Quota {
                limit_dl_bytes: 1,
                limit_ul_bytes: 1,
                period_seconds: 3600,
                start_time: 1_700_000_000,
                used_dl_bytes: 10,
                used_ul_bytes: 0,
                is_throttled: true,
            },
        );
        state.store.save_forecast_point("1700000900", 2.0e8, None, None).unwrap();
        tick(&mut state, 1_700_000_000).await.unwrap();
        assert!(state.shaper.has_class(ip), "quota throttle class must survive apply_clear while the quota is still throttled");
        assert!(state.quotas[&ip].is_throttled);
    }
}
