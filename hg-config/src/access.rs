use anyhow::Result;
use hg_api_types::AccessControl;
use rusqlite::params;

use crate::Store;

impl Store {
    pub fn load_access_control(&self) -> Result<AccessControl> {
        let mode = match self.get_setting("access_control_mode")?.as_deref() {
            Some("block_list") => hg_api_types::AccessControlMode::BlockList,
            Some("allow_list") => hg_api_types::AccessControlMode::AllowList,
            _ => hg_api_types::AccessControlMode::AllowAll,
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT mac_address, list_type FROM mac_access_list")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut ac = AccessControl { mode, ..Default::default() };
        for row in rows {
            let (mac, list_type) = row?;
            match list_type.as_str() {
                "block" => {
                    ac.blocked.insert(mac);
                }
                "allow" => {
                    ac.allowed.insert(mac);
                }
                _ => {}
            }
        }
        Ok(ac)
    }

    pub fn set_access_control_mode(&self, mode: hg_api_types::AccessControlMode) -> Result<()> {
        let tag = match mode {
            hg_api_types::AccessControlMode::AllowAll => "allow_all",
            hg_api_types::AccessControlMode::BlockList => "block_list",
            hg_api_types::AccessControlMode::AllowList => "allow_list",
        };
        self.set_setting("access_control_mode", tag)
    }

    pub fn add_mac(&self, mac: &str, list: &str) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO mac_access_list(mac_address, list_type) VALUES (?1, ?2)
                 ON CONFLICT(mac_address) DO UPDATE SET list_type = excluded.list_type",
                params![mac, list],
            )?;
            Ok(())
        })
    }

    pub fn remove_mac(&self, mac: &str) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM mac_access_list WHERE mac_address = ?1", params![mac])?;
            Ok(())
        })
    }

    pub fn load_ip_block_list(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT ip_range FROM ip_block_list")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn add_ip_block(&self, range: &str) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("INSERT OR IGNORE INTO ip_block_list(ip_range) VALUES (?1)", params![range])?;
            Ok(())
        })
    }

    pub fn remove_ip_block(&self, range: &str) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM ip_block_list WHERE ip_range = ?1", params![range])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_list_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.add_mac("AA:AA:AA:AA:AA:01", "block").unwrap();
        let ac = store.load_access_control().unwrap();
        assert!(ac.blocked.contains("AA:AA:AA:AA:AA:01"));
        store.remove_mac("AA:AA:AA:AA:AA:01").unwrap();
        assert!(store.load_access_control().unwrap().blocked.is_empty());
    }

    #[test]
    fn ip_block_list_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.add_ip_block("10.0.0.0/8").unwrap();
        store.add_ip_block("2001:db8::/32").unwrap();
        let list = store.load_ip_block_list().unwrap();
        assert_eq!(list.len(), 2);
        store.remove_ip_block("10.0.0.0/8").unwrap();
        assert_eq!(store.load_ip_block_list().unwrap().len(), 1);
    }
}
