//! Process supervisor: owns the shared [`GovernorState`], spawns the three
//! cooperative tasks (accounting, scheduler, command listener), and drives
//! the shutdown sequence. Mirrors the shape of
//! `proxmox-backup-proxy`'s `main()` — one `Arc<Mutex<_>>` of shared state,
//! a handful of `tokio::spawn`ed loops, a `watch` channel standing in for
//! an abort-future (this workspace doesn't carry
//! `tokio-util::sync::CancellationToken` as a dependency).

pub mod command_socket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::sync::{watch, Mutex};

use hg_config::Store;
use hg_net::ShellExecutor;

use crate::broadcast::Broadcaster;
use crate::config::DaemonConfig;
use crate::policy::GovernorState;
use crate::{accounting, scheduler, speedtest};

pub struct Supervisor {
    state: Arc<Mutex<GovernorState>>,
    broadcaster: Broadcaster,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(config: DaemonConfig, store: Arc<Store>, shell: Arc<dyn ShellExecutor>) -> Result<Supervisor> {
        let state = GovernorState::load(config, store, shell)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Supervisor {
            state: Arc::new(Mutex::new(state)),
            broadcaster: Broadcaster::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Reprograms the kernel to match persisted state, for the case where
    /// the daemon restarted while the hotspot was up (e.g. a package
    /// upgrade). Every device limit on file is re-applied; the firewall and
    /// shaper setup calls are idempotent.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.hotspot_up {
            return Ok(());
        }
        info!("bootstrap: hotspot was up at last shutdown, reprogramming kernel state");
        state.firewall.setup().await?;
        let dl = state.capacity.available_download_kbps.max(state.config.default_capacity_download_kbps) as u32;
        let ul = state.capacity.available_upload_kbps.max(state.config.default_capacity_upload_kbps) as u32;
        state.shaper.ensure_root_qdisc(dl, ul).await?;
        state.firewall.apply_client_isolation(state.client_isolation).await;
        let blocked: Vec<String> = state.access_control.blocked.iter().cloned().collect();
        let allowed: Vec<String> = state.access_control.allowed.iter().cloned().collect();
        state.firewall.apply_access_control(state.access_control.mode, &blocked, &allowed).await;
        state.firewall.apply_ip_block_list(&state.ip_block_list).await;
        for (ip, limit) in state.manual_limits.clone() {
            state.shaper.add_device_limit(ip, limit.download_kbps, limit.upload_kbps, limit.priority).await?;
        }
        Ok(())
    }

    /// Spawns the four cooperative tasks and blocks until `shutdown` is
    /// called (from a signal handler or a test harness), then runs the
    /// teardown sequence: final scheduler deactivation pass, adaptive
    /// clear, firewall/shaper cleanup, in that order.
    pub async fn run(&self) -> Result<()> {
        let control_socket_path = self.state.lock().await.config.control_socket_path.clone();

        let accounting_handle = tokio::spawn(accounting_loop(self.state.clone(), self.broadcaster.clone(), self.shutdown_rx.clone()));
        let scheduler_handle = tokio::spawn(scheduler_loop(self.state.clone(), self.shutdown_rx.clone()));
        let speedtest_handle = tokio::spawn(speedtest_loop(self.state.clone(), self.shutdown_rx.clone()));
        let control_handle = tokio::spawn(command_socket::serve(control_socket_path, self.state.clone(), self.broadcaster.clone(), self.shutdown_rx.clone()));

        for (name, handle) in [("accounting", accounting_handle), ("scheduler", scheduler_handle), ("speedtest", speedtest_handle)] {
            if let Err(e) = handle.await {
                error!("{name} task panicked: {e}");
            }
        }
        if let Err(e) = control_handle.await {
            error!("control socket task panicked: {e}");
        }

        self.teardown().await
    }

    /// Signals every cooperative task to stop. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A cloneable handle that can signal shutdown from outside (a signal
    /// handler task, a test harness) without holding a reference to the
    /// supervisor itself.
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    async fn teardown(&self) -> Result<()> {
        info!("shutting down: deactivating schedules, clearing adaptive limits, tearing down kernel state");
        let mut state = self.state.lock().await;

        // Restores each device's pre-schedule manual limit/quota in the
        // store so the next boot (or `bootstrap`) sees consistent state,
        // rather than leaving it claimed by a schedule that is about to
        // lose its kernel classes out from under it.
        let active_devices: Vec<std::net::Ipv4Addr> = state.active_schedule_by_device.keys().copied().collect();
        for ip in active_devices {
            if let Err(e) = scheduler::deactivate(&mut state, ip).await {
                warn!("teardown: error while deactivating schedule for {ip}: {e}");
            }
        }
        state.adaptive_set.clear();

        state.shaper.cleanup().await;
        state.firewall.cleanup().await;
        Ok(())
    }
}

async fn accounting_loop(state: Arc<Mutex<GovernorState>>, broadcaster: Broadcaster, mut shutdown: watch::Receiver<bool>) {
    let interval_secs = state.lock().await.config.accounting_interval_secs.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp();
                let mut state = state.lock().await;
                if let Err(e) = accounting::tick(&mut state, &broadcaster, now).await {
                    warn!("accounting tick failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn scheduler_loop(state: Arc<Mutex<GovernorState>>, mut shutdown: watch::Receiver<bool>) {
    let interval_secs = state.lock().await.config.scheduler_interval_secs.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = chrono::Utc::now();
                let mut state = state.lock().await;
                if let Err(e) = scheduler::tick(&mut state, now.date_naive(), now.time(), now.timestamp()).await {
                    warn!("scheduler tick failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Runs an initial probe immediately (so a freshly started daemon doesn't
/// spend its first ten minutes shaping against the configured defaults),
/// then settles into the configured cadence.
async fn speedtest_loop(state: Arc<Mutex<GovernorState>>, mut shutdown: watch::Receiver<bool>) {
    {
        let mut state = state.lock().await;
        if let Err(e) = speedtest::tick(&mut state, chrono::Utc::now().timestamp()).await {
            warn!("speedtest probe failed: {e}");
        }
    }

    let interval_secs = state.lock().await.config.speedtest_interval_secs.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.tick().await; // first tick fires immediately; the probe above already covered it.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut state = state.lock().await;
                if let Err(e) = speedtest::tick(&mut state, chrono::Utc::now().timestamp()).await {
                    warn!("speedtest probe failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
