use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::Result;
use hg_api_types::Quota;
use rusqlite::params;

use crate::Store;

impl Store {
    pub fn load_quotas(&self) -> Result<HashMap<Ipv4Addr, Quota>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ip_address, limit_dl_bytes, limit_ul_bytes, period_seconds, start_time,
                    used_dl_bytes, used_ul_bytes, is_throttled FROM device_quotas",
        )?;
        let rows = stmt.query_map([], |row| {
            let ip: String = row.get(0)?;
            let start_time: f64 = row.get(4)?;
            Ok((
                ip,
                Quota {
                    limit_dl_bytes: row.get::<_, i64>(1)? as u64,
                    limit_ul_bytes: row.get::<_, i64>(2)? as u64,
                    period_seconds: row.get::<_, i64>(3)? as u64,
                    start_time: start_time as i64,
                    used_dl_bytes: row.get::<_, i64>(5)? as u64,
                    used_ul_bytes: row.get::<_, i64>(6)? as u64,
                    is_throttled: row.get::<_, i64>(7)? != 0,
                },
            ))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (ip, quota) = row?;
            if let Ok(ip) = ip.parse() {
                out.insert(ip, quota);
            }
        }
        Ok(out)
    }

    pub fn save_quota(&self, ip: Ipv4Addr, quota: &Quota) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO device_quotas(ip_address, limit_dl_bytes, limit_ul_bytes, period_seconds,
                    start_time, used_dl_bytes, used_ul_bytes, is_throttled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(ip_address) DO UPDATE SET
                    limit_dl_bytes = excluded.limit_dl_bytes,
                    limit_ul_bytes = excluded.limit_ul_bytes,
                    period_seconds = excluded.period_seconds,
                    start_time = excluded.start_time,
                    used_dl_bytes = excluded.used_dl_bytes,
                    used_ul_bytes = excluded.used_ul_bytes,
                    is_throttled = excluded.is_throttled",
                params![
                    ip.to_string(),
                    quota.limit_dl_bytes as i64,
                    quota.limit_ul_bytes as i64,
                    quota.period_seconds as i64,
                    quota.start_time as f64,
                    quota.used_dl_bytes as i64,
                    quota.used_ul_bytes as i64,
                    quota.is_throttled as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_quota(&self, ip: Ipv4Addr) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM device_quotas WHERE ip_address = ?1", params![ip.to_string()])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_quota() {
        let store = Store::open_in_memory().unwrap();
        let ip: Ipv4Addr = "192.168.12.40".parse().unwrap();
        let quota = Quota {
            limit_dl_bytes: 1_000_000,
            limit_ul_bytes: 1_000_000,
            period_seconds: 10,
            start_time: 1_700_000_000,
            used_dl_bytes: 0,
            used_ul_bytes: 0,
            is_throttled: false,
        };
        store.save_quota(ip, &quota).unwrap();
        let loaded = store.load_quotas().unwrap();
        assert_eq!(loaded.get(&ip).unwrap().period_seconds, 10);

        let mut throttled = quota;
        throttled.is_throttled = true;
        throttled.used_dl_bytes = 2_000_000;
        store.save_quota(ip, &throttled).unwrap();
        assert!(store.load_quotas().unwrap().get(&ip).unwrap().is_throttled);

        store.delete_quota(ip).unwrap();
        assert!(store.load_quotas().unwrap().is_empty());
    }
}
