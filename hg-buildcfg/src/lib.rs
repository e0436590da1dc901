//! Compiled-in paths and system identities for the hotspot governor.

pub const GOVERNOR_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const GOVERNOR_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");

/// The configured configuration directory (daemon TOML config, not policy data).
pub const CONFIGDIR: &str = "/etc/hotspot-governor";

/// Unix system user `hotspotd` runs under. The daemon itself requires root for
/// `tc`/`iptables`/`ip` access; this name is reserved for a future privilege-drop
/// path and is not currently enforced.
pub const GOVERNOR_USER_NAME: &str = "root";
pub const GOVERNOR_GROUP_NAME: &str = "root";

#[macro_export]
macro_rules! GOVERNOR_RUN_DIR_M {
    () => {
        "/run/hotspot-governor"
    };
}

#[macro_export]
macro_rules! GOVERNOR_STATE_DIR_M {
    () => {
        "/var/lib/hotspot-governor"
    };
}

#[macro_export]
macro_rules! GOVERNOR_LOG_DIR_M {
    () => {
        "/var/log/hotspot-governor"
    };
}

/// namespaced directory for in-memory (tmpfs) run state: pid file, control socket.
pub const GOVERNOR_RUN_DIR: &str = GOVERNOR_RUN_DIR_M!();

/// namespaced directory for persistent state: the sqlite policy store.
pub const GOVERNOR_STATE_DIR: &str = GOVERNOR_STATE_DIR_M!();

/// namespaced directory for persistent logging (used only by the foreground/debug fallback).
pub const GOVERNOR_LOG_DIR: &str = GOVERNOR_LOG_DIR_M!();

/// the daemon's control socket, used by `govctl` and any front-end.
pub const GOVERNOR_SOCKET_FN: &str = concat!(GOVERNOR_RUN_DIR_M!(), "/hotspotd.sock");

/// the PID filename for `hotspotd`.
pub const GOVERNOR_PID_FN: &str = concat!(GOVERNOR_RUN_DIR_M!(), "/hotspotd.pid");

/// default location of the sqlite policy store (overridable via the daemon TOML config).
pub const GOVERNOR_DB_FN: &str = concat!("/var/lib/hotspot-governor", "/governor.db");

/// Prepend the configuration directory to a file name.
///
/// #### Example:
/// ```
/// use hg_buildcfg::configdir;
/// let cfg_path = configdir!("/hotspotd.toml");
/// ```
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/hotspot-governor", $subdir)
    };
}

/// Prepend the run directory to a file name.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!($crate::GOVERNOR_RUN_DIR_M!(), $subdir)
    };
}

/// default location of the daemon's own TOML runtime config.
pub const GOVERNOR_CONFIG_FN: &str = configdir!("/hotspotd.toml");
