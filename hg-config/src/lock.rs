use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use nix::fcntl::{flock, FlockArg};

/// Holds an exclusive advisory lock on the store's lock file for the
/// lifetime of the guard. Dropping the guard releases the lock (closing the
/// file descriptor is sufficient under `flock(2)` semantics).
pub struct StoreLockGuard(#[allow(dead_code)] std::fs::File);

/// Opens (creating if necessary) the lock file alongside the database and
/// takes an exclusive `flock`, polling until `timeout` elapses. Mirrors
/// `open_backup_lockfile`, simplified to a plain `flock` since this
/// daemon runs entirely as root and has no separate lock-owning user/group to
/// chown the file to.
pub fn lock_store<P: AsRef<Path>>(path: P, timeout: Option<Duration>) -> Result<StoreLockGuard, Error> {
    let timeout = timeout.unwrap_or(Duration::from_secs(10));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path.as_ref())
        .with_context(|| format!("failed to open lock file {:?}", path.as_ref()))?;

    let deadline = Instant::now() + timeout;
    loop {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => return Ok(StoreLockGuard(file)),
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                if Instant::now() >= deadline {
                    bail!("timed out waiting for store lock at {:?}", path.as_ref());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(Error::from(e)).context("failed to lock store file"),
        }
    }
}
