//! `hotspotd` — the privileged hotspot governor daemon.
//!
//! Startup mirrors `proxmox-backup-proxy`'s entrypoint: init logging first,
//! load the TOML runtime config, open the sqlite store, build the shared
//! policy state, then hand off to the supervisor. Grounded on
//! `proxmox-backup-proxy.rs` for the init-then-serve shape, generalized
//! from its hyper/TLS listener to this daemon's Unix-socket control plane
//! plus the accounting/scheduler tick loops.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info};

use hg_net::RealShell;
use hotspot_governor::config::DaemonConfig;
use hotspot_governor::logging;
use hotspot_governor::server::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "hotspotd", about = "Privileged WiFi hotspot bandwidth governor daemon")]
struct Args {
    /// Run attached to the terminal with logs on stderr instead of syslog.
    #[arg(long)]
    foreground: bool,

    /// Path to the daemon's own TOML runtime config.
    #[arg(long, default_value = hg_buildcfg::GOVERNOR_CONFIG_FN)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init("hotspotd", args.foreground).context("failed to initialize logging")?;

    if !nix::unistd::Uid::effective().is_root() {
        bail!("hotspotd must run as root (tc/iptables/ip require CAP_NET_ADMIN)");
    }

    let config = DaemonConfig::load(&args.config)?;
    std::fs::create_dir_all(hg_buildcfg::GOVERNOR_RUN_DIR).context("creating run directory")?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("creating state directory")?;
    }

    let store = Arc::new(hg_config::Store::open(&config.db_path).with_context(|| format!("opening store at {:?}", config.db_path))?);
    let shell = Arc::new(RealShell::new());

    let supervisor = Supervisor::new(config, store, shell)?;
    supervisor.bootstrap().await.context("bootstrap failed")?;

    let shutdown_tx = supervisor.shutdown_sender();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!("hotspotd starting up");
    if let Err(e) = supervisor.run().await {
        error!("supervisor exited with error: {e:#}");
        return Err(e);
    }
    info!("hotspotd shut down cleanly");
    Ok(())
}

/// Waits for either Ctrl-C or SIGTERM, whichever arrives first — matches
/// how a systemd unit and an interactive run both expect to stop this
/// daemon.
async fn wait_for_termination() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
