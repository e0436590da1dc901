use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::Result;
use hg_api_types::ManualLimit;
use rusqlite::params;

use crate::Store;

impl Store {
    pub fn load_limits(&self) -> Result<HashMap<Ipv4Addr, ManualLimit>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT ip_address, download_kbps, upload_kbps, priority FROM device_limits")?;
        let rows = stmt.query_map([], |row| {
            let ip: String = row.get(0)?;
            Ok((
                ip,
                ManualLimit {
                    download_kbps: row.get(1)?,
                    upload_kbps: row.get(2)?,
                    priority: row.get(3)?,
                },
            ))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (ip, limit) = row?;
            if let Ok(ip) = ip.parse() {
                out.insert(ip, limit);
            }
        }
        Ok(out)
    }

    pub fn save_limit(&self, ip: Ipv4Addr, limit: &ManualLimit) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO device_limits(ip_address, download_kbps, upload_kbps, priority) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(ip_address) DO UPDATE SET download_kbps = excluded.download_kbps,
                    upload_kbps = excluded.upload_kbps, priority = excluded.priority",
                params![ip.to_string(), limit.download_kbps, limit.upload_kbps, limit.priority],
            )?;
            Ok(())
        })
    }

    pub fn delete_limit(&self, ip: Ipv4Addr) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM device_limits WHERE ip_address = ?1", params![ip.to_string()])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_limit() {
        let store = Store::open_in_memory().unwrap();
        let ip: Ipv4Addr = "192.168.12.25".parse().unwrap();
        let limit = ManualLimit { download_kbps: 2048, upload_kbps: 512, priority: 3 };
        store.save_limit(ip, &limit).unwrap();
        let loaded = store.load_limits().unwrap();
        assert_eq!(loaded.get(&ip).unwrap().download_kbps, 2048);
        store.delete_limit(ip).unwrap();
        assert!(store.load_limits().unwrap().is_empty());
    }
}
