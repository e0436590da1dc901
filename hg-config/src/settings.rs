use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::Store;

impl Store {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO settings(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn get_bool_setting(&self, key: &str, default: bool) -> Result<bool> {
        Ok(match self.get_setting(key)? {
            Some(v) => v == "1",
            None => default,
        })
    }

    pub fn set_bool_setting(&self, key: &str, value: bool) -> Result<()> {
        self.set_setting(key, if value { "1" } else { "0" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_setting() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_setting("ssid").unwrap(), None);
        store.set_setting("ssid", "my-hotspot").unwrap();
        assert_eq!(store.get_setting("ssid").unwrap(), Some("my-hotspot".to_string()));
        store.set_setting("ssid", "renamed").unwrap();
        assert_eq!(store.get_setting("ssid").unwrap(), Some("renamed".to_string()));
    }

    #[test]
    fn bool_setting_defaults_when_absent() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.get_bool_setting("client_isolation", false).unwrap());
        store.set_bool_setting("client_isolation", true).unwrap();
        assert!(store.get_bool_setting("client_isolation", false).unwrap());
    }
}
