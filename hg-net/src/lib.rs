//! Privileged networking effectors.
//!
//! Every kernel-touching operation in the governor — `tc`, `iptables`,
//! `ip6tables`, `ip`, `modprobe` — flows through [`ShellExecutor`]. Nothing
//! above this crate invokes a subprocess directly, which is what makes the
//! quota engine, scheduler, and adaptive controller testable against
//! [`FakeShell`] instead of a live network namespace.

mod error;
mod firewall;
mod shaper;
mod shell;

pub use error::{FirewallError, ShaperError};
pub use firewall::{check_device_active, FirewallManager};
pub use shaper::TrafficShaper;
pub use shell::{CommandOutput, FakeShell, RealShell, ShellExecutor};
