//! Line-delimited JSON Unix-domain control socket, generalized
//! from plain request/response to request/response-plus-broadcast-
//! subscription: every connected client's commands are answered directly,
//! and every client also receives every [`Message`] the supervisor
//! broadcasts for as long as it stays connected. Mirrors
//! `proxmox-rest-server::command_socket`'s accept-loop-plus-peer-credential
//! shape, rewritten against current tokio/nix instead of its original
//! futures-0.1-era plumbing.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hg_api_types::{Command, CommandResult, Message};
use log::{debug, info, warn};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use crate::broadcast::Broadcaster;
use crate::command_bus;
use crate::policy::GovernorState;

/// Accepts connections on `path` until `shutdown` fires. Each connection is
/// handled on its own task; a slow or hung client cannot stall the others or
/// the caller.
pub async fn serve(
    path: PathBuf,
    state: Arc<Mutex<GovernorState>>,
    broadcaster: Broadcaster,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).with_context(|| format!("binding control socket at {path:?}"))?;
    info!("control socket listening at {path:?}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("control socket accept failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = check_peer_credentials(&conn) {
                    warn!("control socket: rejecting connection: {e}");
                    continue;
                }
                let state = state.clone();
                let broadcaster = broadcaster.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, state, broadcaster, shutdown).await {
                        debug!("control socket connection ended: {e}");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("control socket shutting down");
                    break;
                }
            }
        }
    }
    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// Only root, or a peer sharing this process's gid, may issue commands —
/// this socket controls a privileged traffic-shaping/firewall daemon.
fn check_peer_credentials(conn: &UnixStream) -> Result<()> {
    let cred = getsockopt(conn.as_raw_fd(), PeerCredentials).context("reading peer credentials")?;
    let my_gid = unsafe { libc::getgid() };
    if cred.uid() == 0 || cred.gid() == my_gid {
        Ok(())
    } else {
        bail!("peer uid={} gid={} not authorized", cred.uid(), cred.gid())
    }
}

async fn handle_connection(
    conn: UnixStream,
    state: Arc<Mutex<GovernorState>>,
    broadcaster: Broadcaster,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let (rx, mut tx) = tokio::io::split(conn);
    let mut lines = BufReader::new(rx).lines();
    let mut broadcast_rx = broadcaster.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let result = match serde_json::from_str::<Command>(&line) {
                    Ok(command) => {
                        let now = chrono::Utc::now().timestamp();
                        let mut state = state.lock().await;
                        command_bus::dispatch(&mut state, &broadcaster, command, now).await
                    }
                    Err(e) => CommandResult::Error { message: format!("invalid command: {e}") },
                };
                write_line(&mut tx, &result).await?;
            }
            received = broadcast_rx.recv() => {
                match received {
                    Ok(message) => write_line(&mut tx, &message).await?,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("control socket client lagged, dropped {n} broadcast messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn write_line<T: serde::Serialize>(tx: &mut (impl AsyncWriteExt + Unpin), value: &T) -> Result<()> {
    let mut encoded = serde_json::to_string(value)?;
    encoded.push('\n');
    tx.write_all(encoded.as_bytes()).await?;
    Ok(())
}

/// Sends a single command over `path` and returns its reply, for one-shot
/// clients like `govctl` that don't want to stay subscribed to the
/// broadcast stream.
pub async fn send_command(path: impl Into<PathBuf>, command: &Command) -> Result<CommandResult> {
    let path: PathBuf = path.into();
    let mut conn = UnixStream::connect(&path).await.with_context(|| format!("connecting to control socket at {path:?}"))?;

    let mut payload = serde_json::to_string(command)?;
    payload.push('\n');
    conn.write_all(payload.as_bytes()).await?;

    let mut rx = BufReader::new(conn);
    let mut line = String::new();
    loop {
        line.clear();
        if rx.read_line(&mut line).await? == 0 {
            bail!("control socket closed without a reply");
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Skip broadcast `Message`s (tagged "type") that may arrive ahead of
        // our own `CommandResult` (tagged "status") if another client's
        // command races ours.
        if let Ok(result) = serde_json::from_str::<CommandResult>(trimmed) {
            return Ok(result);
        }
        if serde_json::from_str::<Message>(trimmed).is_ok() {
            continue;
        }
        bail!("unrecognized reply: {trimmed}");
    }
}
