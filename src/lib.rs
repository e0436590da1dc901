//! Policy and enforcement engine for a privileged WiFi-hotspot bandwidth
//! governor.
//!
//! This crate owns the three cooperative tasks that keep a hotspot's
//! bandwidth policy enforced — the accounting loop, the scheduler, and the
//! command listener — plus the
//! in-memory policy store ([`policy::GovernorState`]) they all serialize
//! access to. Every kernel-touching effect flows through `hg_net`; every
//! persisted fact flows through `hg_config`. Nothing in this crate talks to
//! `tc`/`iptables`/sqlite directly.

pub mod accounting;
pub mod adaptive;
pub mod broadcast;
pub mod command_bus;
pub mod config;
pub mod inventory;
pub mod logging;
pub mod policy;
pub mod quota;
pub mod scheduler;
pub mod server;
pub mod speedtest;
