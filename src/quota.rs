//! Rolling data quota engine.
//!
//! One function, [`apply_tick`], folds one accounting tick's `(rx_delta,
//! tx_delta)` into a device's quota and drives the throttle/restore
//! transition. Order matters: a period reset clears and restarts the
//! counters *before* this tick's delta is added, and only then is
//! `used >= limit` evaluated — matching
//! `hotspot_manager_core.py::get_connected_devices_with_bandwidth`'s reset-
//! then-accumulate-then-check sequence (see DESIGN.md).

use std::net::Ipv4Addr;

use anyhow::Result;
use hg_api_types::ManualLimit;
use log::{info, warn};

use crate::policy::GovernorState;

/// Applies one tick's deltas to `ip`'s quota, if it has one, persisting the
/// result. No-op if the device carries no quota.
pub async fn apply_tick(state: &mut GovernorState, ip: Ipv4Addr, rx_delta: u64, tx_delta: u64, now: i64) -> Result<()> {
    let Some(mut quota) = state.quotas.get(&ip).copied() else {
        return Ok(());
    };

    if quota.period_expired(now) {
        if quota.is_throttled {
            info!("quota: period reset for {ip}, clearing throttle");
            quota.is_throttled = false;
            restore_baseline_for_quota_clear(state, ip).await?;
        }
        quota.start_time = now;
        quota.used_dl_bytes = 0;
        quota.used_ul_bytes = 0;
    }

    quota.used_dl_bytes += rx_delta;
    quota.used_ul_bytes += tx_delta;

    if quota.exceeded() {
        if !quota.is_throttled {
            warn!("quota exceeded for {ip}, applying 8kbit throttle");
            if let Err(e) = state.shaper.add_device_limit(ip, ManualLimit::THROTTLE.download_kbps, ManualLimit::THROTTLE.upload_kbps, ManualLimit::THROTTLE.priority).await {
                warn!("failed to apply quota throttle for {ip}: {e}");
            }
            quota.is_throttled = true;
            if state.adaptive_set.remove(&ip) {
                info!("quota: throttle overriding adaptive fair-use limit for {ip}");
            }
        }
    } else if quota.is_throttled {
        info!("quota no longer exceeded for {ip}, removing throttle");
        quota.is_throttled = false;
        restore_baseline_for_quota_clear(state, ip).await?;
    }

    state.store.save_quota(ip, &quota)?;
    state.quotas.insert(ip, quota);
    Ok(())
}

/// Restores the manual limit if one is on file, else removes the shaper
/// class entirely — the action taken both on period-reset-while-throttled
/// and on exceeded-to-ok transitions.
async fn restore_baseline_for_quota_clear(state: &mut GovernorState, ip: Ipv4Addr) -> Result<()> {
    if let Some(limit) = state.manual_limits.get(&ip).copied() {
        state.shaper.add_device_limit(ip, limit.download_kbps, limit.upload_kbps, limit.priority).await?;
    } else {
        state.shaper.remove_device_limit(ip).await?;
    }
    Ok(())
}

/// Removes a device's quota entirely, restoring baseline.
pub async fn remove(state: &mut GovernorState, ip: Ipv4Addr) -> Result<()> {
    let was_throttled = state.quotas.get(&ip).map(|q| q.is_throttled).unwrap_or(false);
    state.quotas.remove(&ip);
    state.store.delete_quota(ip)?;
    if was_throttled {
        restore_baseline_for_quota_clear(state, ip).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hg_api_types::Quota;
    use hg_config::Store;
    use hg_net::{FakeShell, ShellExecutor};

    fn test_state() -> GovernorState {
        let shell: Arc<dyn ShellExecutor> = Arc::new(FakeShell::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        GovernorState::load(crate::config::DaemonConfig::default(), store, shell).unwrap()
    }

    #[tokio::test]
    async fn exceeding_quota_throttles_within_one_tick() {
        let mut state = test_state();
        let ip: Ipv4Addr = "192.168.12.40".parse().unwrap();
        state.quotas.insert(
            ip,
            Quota {
                limit_dl_bytes: 1_000_000,
                limit_ul_bytes: 1_000_000,
                period_seconds: 10,
                start_time: 1_000,
                used_dl_bytes: 0,
                used_ul_bytes: 0,
                is_throttled: false,
            },
        );
        apply_tick(&mut state, ip, 200_000, 0, 1_001).await.unwrap();
        assert!(!state.quotas[&ip].is_throttled);
        apply_tick(&mut state, ip, 900_000, 0, 1_002).await.unwrap();
        assert!(state.quotas[&ip].is_throttled);
    }

    #[tokio::test]
    async fn period_reset_clears_throttle_and_zeroes_usage() {
        let mut state = test_state();
        let ip: Ipv4Addr = "192.168.12.40".parse().unwrap();
        state.quotas.insert(
            ip,
            Quota {
                limit_dl_bytes: 1_000_000,
                limit_ul_bytes: 1_000_000,
                period_seconds: 10,
                start_time: 1_000,
                used_dl_bytes: 1_200_000,
                used_ul_bytes: 0,
                is_throttled: true,
            },
        );
        apply_tick(&mut state, ip, 0, 0, 1_011).await.unwrap();
        let q = state.quotas[&ip];
        assert!(!q.is_throttled);
        assert_eq!(q.used_dl_bytes, 0);
        assert_eq!(q.start_time, 1_011);
    }

    #[tokio::test]
    async fn removing_a_throttled_quota_restores_manual_limit() {
        let mut state = test_state();
        let ip: Ipv4Addr = "192.168.12.40".parse().unwrap();
        state.manual_limits.insert(ip, ManualLimit { download_kbps: 2048, upload_kbps: 512, priority: 3 });
        state.quotas.insert(
            ip,
            Quota {
                limit_dl_bytes: 1,
                limit_ul_bytes: 1,
                period_seconds: 10,
                start_time: 1_000,
                used_dl_bytes: 10,
                used_ul_bytes: 0,
                is_throttled: true,
            },
        );
        remove(&mut state, ip).await.unwrap();
        assert!(state.quotas.get(&ip).is_none());
    }
}
