use anyhow::{Context, Result};
use log::LevelFilter;

/// Initializes `syslog` (facility `LOG_DAEMON`) as the `log` backend, mirroring
/// `proxmox-backup-proxy`'s startup sequence. When `foreground` is set
/// (interactive/debug runs), logs go to stderr instead so the daemon is
/// runnable from a terminal during development.
pub fn init(ident: &str, foreground: bool) -> Result<()> {
    if foreground {
        env_logger_init();
        return Ok(());
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: ident.to_string(),
        pid: std::process::id(),
    };

    let logger = syslog::unix(formatter).context("failed to connect to syslog")?;
    log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
        .map(|()| log::set_max_level(LevelFilter::Info))
        .context("failed to install syslog logger")
}

fn env_logger_init() {
    let _ = env_logger_builder().try_init();
}

fn env_logger_builder() -> env_logger::Builder {
    use std::io::Write;
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(LevelFilter::Debug);
    builder.format(|buf, record| writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args()));
    builder
}
