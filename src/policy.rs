use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Result;
use hg_api_types::{AccessControl, Capacity, Device, ManualLimit, PreScheduleState, Quota, Schedule};
use hg_config::Store;
use hg_net::{FirewallManager, ShellExecutor, TrafficShaper};

use crate::config::DaemonConfig;

/// Everything the three cooperative tasks (accounting, scheduler, command
/// listener) read and mutate. Held by the supervisor behind one
/// `tokio::sync::Mutex` — see `hotspot_governor::server` — so that no two
/// effectors ever observe a partially applied device rule.
/// A parsed IPv4 `address/prefix_len`, used only to decide whether an
/// observed device belongs to the hotspot's own subnet (filtered to its
/// /24).
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Network {
    addr: Ipv4Addr,
    prefix_len: u32,
}

impl Ipv4Network {
    pub fn parse(cidr: &str) -> Result<Ipv4Network> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("expected address/prefix, got {cidr:?}"))?;
        Ok(Ipv4Network {
            addr: addr.parse()?,
            prefix_len: prefix.parse()?,
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.addr) & self.mask()
    }

    pub fn first_address(&self) -> Ipv4Addr {
        self.addr
    }
}

pub struct GovernorState {
    pub config: DaemonConfig,
    pub network: Ipv4Network,
    pub store: Arc<Store>,
    pub shell: Arc<dyn ShellExecutor>,
    pub firewall: FirewallManager,
    pub shaper: TrafficShaper,

    pub hotspot_up: bool,
    pub devices: HashMap<Ipv4Addr, Device>,
    pub manual_limits: HashMap<Ipv4Addr, ManualLimit>,
    pub quotas: HashMap<Ipv4Addr, Quota>,
    pub schedules: Vec<Schedule>,
    pub access_control: AccessControl,
    pub client_isolation: bool,
    pub ip_block_list: Vec<String>,
    pub capacity: Capacity,

    /// device -> id of the schedule currently claiming it.
    pub active_schedule_by_device: HashMap<Ipv4Addr, i64>,
    pub pre_schedule_state: HashMap<Ipv4Addr, PreScheduleState>,
    /// devices currently carrying the adaptive fair-use class.
    pub adaptive_set: HashSet<Ipv4Addr>,

    /// session totals since the device was first observed.
    pub session_totals: HashMap<Ipv4Addr, (u64, u64)>,
    /// last raw cumulative counters read from whichever source (shaper or
    /// monitoring chain) was active for this device.
    pub last_raw: HashMap<Ipv4Addr, (u64, u64)>,
}

impl GovernorState {
    /// Loads every persisted table into memory. Does not touch the kernel;
    /// callers re-apply rules afterward if the hotspot is already up (see
    /// `server::Supervisor::bootstrap`).
    pub fn load(
        config: DaemonConfig,
        store: Arc<Store>,
        shell: Arc<dyn ShellExecutor>,
    ) -> Result<GovernorState> {
        let network = Ipv4Network::parse(&config.network_cidr)?;
        let firewall = FirewallManager::new(shell.clone(), config.hotspot_interface.clone());
        let shaper = TrafficShaper::new(shell.clone(), config.hotspot_interface.clone(), config.ifb_device.clone());

        let manual_limits = store.load_limits()?;
        let quotas = store.load_quotas()?;
        let schedules = store.load_schedules()?;
        let access_control = store.load_access_control()?;
        let client_isolation = store.get_bool_setting("client_isolation", false)?;
        let ip_block_list = store.load_ip_block_list()?;
        let hotspot_up = store.get_bool_setting("hotspot_up", false)?;

        Ok(GovernorState {
            config,
            network,
            store,
            shell,
            firewall,
            shaper,
            hotspot_up,
            devices: HashMap::new(),
            manual_limits,
            quotas,
            schedules,
            access_control,
            client_isolation,
            ip_block_list,
            capacity: Capacity {
                available_download_kbps: 0.0,
                available_upload_kbps: 0.0,
                last_measured_at: 0,
            },
            active_schedule_by_device: HashMap::new(),
            pre_schedule_state: HashMap::new(),
            adaptive_set: HashSet::new(),
            session_totals: HashMap::new(),
            last_raw: HashMap::new(),
        })
    }

    /// Applies a manual limit to the shaper and records it as the
    /// source-of-truth for `ip`. Used directly by `set_limit` and indirectly
    /// by every restore path (quota clear, schedule deactivation, adaptive
    /// override).
    pub async fn apply_manual_limit(&mut self, ip: Ipv4Addr, limit: ManualLimit) -> Result<()> {
        self.shaper
            .add_device_limit(ip, limit.download_kbps, limit.upload_kbps, limit.priority)
            .await?;
        self.manual_limits.insert(ip, limit);
        self.store.save_limit(ip, &limit)?;
        self.adaptive_set.remove(&ip);
        Ok(())
    }

    pub async fn remove_manual_limit(&mut self, ip: Ipv4Addr) -> Result<()> {
        self.manual_limits.remove(&ip);
        self.store.delete_limit(ip)?;
        if self.quotas.get(&ip).map(|q| q.is_throttled).unwrap_or(false) {
            // the quota's hard-cap class stays installed; removing the
            // manual limit alone must not lift an active throttle.
            return Ok(());
        }
        if !self.active_schedule_by_device.contains_key(&ip) {
            self.shaper.remove_device_limit(ip).await?;
        }
        Ok(())
    }

    /// What every "clear this override" path restores: the device's manual
    /// limit if one is on file, otherwise no shaper class at all. Used after
    /// a quota throttle clears, after a schedule deactivates, and after the
    /// adaptive controller releases a device.
    pub async fn restore_baseline(&mut self, ip: Ipv4Addr) -> Result<()> {
        if let Some(limit) = self.manual_limits.get(&ip).copied() {
            self.shaper
                .add_device_limit(ip, limit.download_kbps, limit.upload_kbps, limit.priority)
                .await?;
        } else {
            self.shaper.remove_device_limit(ip).await?;
        }
        Ok(())
    }

    pub fn ip_in_network(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(ip)
    }

    pub fn hotspot_ip(&self) -> Ipv4Addr {
        self.network.first_address()
    }
}
