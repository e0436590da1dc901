//! Periodic aggregate-capacity probe.
//!
//! `speedtest-cli` is listed alongside `tc`/`iptables`/`ip` as one of the
//! privileged tools this crate invokes — the probe itself (and the
//! methodology it uses to measure a link) is somebody else's problem; we
//! just run it, parse its `--json` output, and feed the result into
//! [`GovernorState::capacity`]. Mockable through the same [`ShellExecutor`]
//! as every other kernel-touching effect.

use anyhow::Result;
use log::{info, warn};
use serde::Deserialize;

use hg_api_types::Capacity;
use hg_net::ShellExecutor;

use crate::policy::GovernorState;

/// `speedtest-cli` can legitimately take the better part of a minute.
pub const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(90);

/// The handful of fields we care about in `speedtest-cli --json`'s output.
/// `download`/`upload` are bits per second; everything else (server choice,
/// ping, share URL, ...) is ignored.
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    download: f64,
    #[serde(default)]
    upload: f64,
}

/// Runs one probe and, on a usable result, updates `state.capacity` and
/// (if the hotspot is currently up) reprograms the root HTB classes to the
/// new totals. A failed invocation, unparseable output, or a reported zero
/// download is logged and otherwise ignored — the last-known capacity (or
/// the configured default, if none has ever landed) stays in effect.
pub async fn tick(state: &mut GovernorState, now: i64) -> Result<()> {
    let output = state.shell.run_timeout(&["speedtest-cli", "--json"], PROBE_TIMEOUT).await;
    if !output.success() {
        warn!("speedtest probe failed (exit {}): {}", output.code, output.stderr.trim());
        return Ok(());
    }

    let parsed: ProbeOutput = match serde_json::from_str(&output.stdout) {
        Ok(p) => p,
        Err(e) => {
            warn!("speedtest probe: couldn't parse --json output: {e}");
            return Ok(());
        }
    };

    let download_kbps = parsed.download / 1000.0;
    let upload_kbps = parsed.upload / 1000.0;
    if download_kbps <= 0.0 {
        warn!("speedtest probe: reported 0 download, keeping last-known capacity");
        return Ok(());
    }

    state.capacity = Capacity {
        available_download_kbps: download_kbps,
        available_upload_kbps: upload_kbps,
        last_measured_at: now,
    };
    info!("speedtest probe: capacity now {download_kbps:.0}/{upload_kbps:.0} kbps (down/up)");

    if state.hotspot_up {
        state.shaper.update_root_rate(download_kbps as u32, upload_kbps as u32).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hg_net::{FakeShell, CommandOutput};

    use super::*;
    use crate::config::DaemonConfig;

    async fn fresh_state(shell: Arc<FakeShell>) -> GovernorState {
        let store = Arc::new(hg_config::Store::open_in_memory().unwrap());
        GovernorState::load(DaemonConfig::default(), store, shell).unwrap()
    }

    #[tokio::test]
    async fn successful_probe_updates_capacity_and_leaves_tc_untouched_while_down() {
        let shell = Arc::new(FakeShell::new());
        shell.queue_response(
            "speedtest-cli",
            CommandOutput { stdout: r#"{"download": 50000000.0, "upload": 10000000.0}"#.to_string(), stderr: String::new(), code: 0 },
        );
        let mut state = fresh_state(shell.clone()).await;
        assert!(!state.hotspot_up);

        tick(&mut state, 1_000).await.unwrap();

        assert_eq!(state.capacity.available_download_kbps, 50_000.0);
        assert_eq!(state.capacity.available_upload_kbps, 10_000.0);
        assert_eq!(state.capacity.last_measured_at, 1_000);
        assert!(shell.calls_matching("tc").is_empty());
    }

    #[tokio::test]
    async fn successful_probe_reprograms_root_classes_while_hotspot_is_up() {
        let shell = Arc::new(FakeShell::new());
        shell.queue_response(
            "speedtest-cli",
            CommandOutput { stdout: r#"{"download": 20000000.0, "upload": 5000000.0}"#.to_string(), stderr: String::new(), code: 0 },
        );
        let mut state = fresh_state(shell.clone()).await;
        state.hotspot_up = true;

        tick(&mut state, 2_000).await.unwrap();

        let changes = shell.calls_matching("tc");
        assert!(changes.iter().any(|argv| argv.contains(&"1:1".to_string())));
        assert!(changes.iter().any(|argv| argv.contains(&"2:1".to_string())));
    }

    #[tokio::test]
    async fn failed_invocation_leaves_capacity_unchanged() {
        let shell = Arc::new(FakeShell::new());
        shell.queue_response("speedtest-cli", CommandOutput { stdout: String::new(), stderr: "No servers".to_string(), code: 1 });
        let mut state = fresh_state(shell.clone()).await;
        state.capacity.available_download_kbps = 7_500.0;

        tick(&mut state, 3_000).await.unwrap();

        assert_eq!(state.capacity.available_download_kbps, 7_500.0);
        assert_eq!(state.capacity.last_measured_at, 0);
    }

    #[tokio::test]
    async fn zero_download_is_treated_as_a_failed_probe() {
        let shell = Arc::new(FakeShell::new());
        shell.queue_response(
            "speedtest-cli",
            CommandOutput { stdout: r#"{"download": 0.0, "upload": 0.0}"#.to_string(), stderr: String::new(), code: 0 },
        );
        let mut state = fresh_state(shell.clone()).await;
        state.capacity.available_download_kbps = 9_000.0;

        tick(&mut state, 4_000).await.unwrap();

        assert_eq!(state.capacity.available_download_kbps, 9_000.0);
    }
}
