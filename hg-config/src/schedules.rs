use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use hg_api_types::{RepeatMode, RuleType, Schedule};
use rusqlite::params;

use crate::Store;

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

fn repeat_mode_tag(mode: &RepeatMode) -> &'static str {
    match mode {
        RepeatMode::Once => "once",
        RepeatMode::Daily => "daily",
        RepeatMode::Weekdays => "weekdays",
        RepeatMode::Weekends => "weekends",
        RepeatMode::Custom { .. } => "custom",
    }
}

impl Store {
    pub fn load_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, device_ip, rule_type, start_date, end_date, start_time, end_time,
                    repeat_mode, custom_days, limit_dl_kbps, limit_ul_kbps, priority,
                    quota_dl_bytes, quota_ul_bytes, quota_period_seconds, is_enabled
             FROM schedules",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let name: String = row.get(1)?;
            let device_ip: String = row.get(2)?;
            let rule_type: String = row.get(3)?;
            let start_date: Option<String> = row.get(4)?;
            let end_date: Option<String> = row.get(5)?;
            let start_time: String = row.get(6)?;
            let end_time: String = row.get(7)?;
            let repeat_mode: String = row.get(8)?;
            let custom_days: Option<String> = row.get(9)?;
            let limit_dl_kbps: Option<i64> = row.get(10)?;
            let limit_ul_kbps: Option<i64> = row.get(11)?;
            let priority: Option<i64> = row.get(12)?;
            let quota_dl_bytes: Option<i64> = row.get(13)?;
            let quota_ul_bytes: Option<i64> = row.get(14)?;
            let quota_period_seconds: Option<i64> = row.get(15)?;
            let is_enabled: i64 = row.get(16)?;
            Ok((
                id,
                name,
                device_ip,
                rule_type,
                start_date,
                end_date,
                start_time,
                end_time,
                repeat_mode,
                custom_days,
                limit_dl_kbps,
                limit_ul_kbps,
                priority,
                quota_dl_bytes,
                quota_ul_bytes,
                quota_period_seconds,
                is_enabled,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                id,
                name,
                device_ip,
                rule_type,
                start_date,
                end_date,
                start_time,
                end_time,
                repeat_mode,
                custom_days,
                limit_dl_kbps,
                limit_ul_kbps,
                priority,
                quota_dl_bytes,
                quota_ul_bytes,
                quota_period_seconds,
                is_enabled,
            ) = row?;

            let rule = match rule_type.as_str() {
                "limit" => RuleType::Limit {
                    download_kbps: limit_dl_kbps.unwrap_or(0) as u32,
                    upload_kbps: limit_ul_kbps.unwrap_or(0) as u32,
                    priority: priority.unwrap_or(5) as u8,
                },
                _ => RuleType::Quota {
                    limit_dl_bytes: quota_dl_bytes.unwrap_or(0) as u64,
                    limit_ul_bytes: quota_ul_bytes.unwrap_or(0) as u64,
                    period_seconds: quota_period_seconds.map(|p| p as u64),
                },
            };

            let mode = match repeat_mode.as_str() {
                "daily" => RepeatMode::Daily,
                "weekdays" => RepeatMode::Weekdays,
                "weekends" => RepeatMode::Weekends,
                "custom" => {
                    let days: [bool; 7] = custom_days
                        .as_deref()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or([false; 7]);
                    RepeatMode::Custom { days }
                }
                _ => RepeatMode::Once,
            };

            out.push(Schedule {
                id,
                name,
                device_ip: device_ip.parse().context("invalid device_ip in schedules row")?,
                rule,
                start_date: start_date.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FMT).ok()),
                end_date: end_date.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FMT).ok()),
                start_time: NaiveTime::parse_from_str(&start_time, TIME_FMT).context("invalid start_time")?,
                end_time: NaiveTime::parse_from_str(&end_time, TIME_FMT).context("invalid end_time")?,
                repeat_mode: mode,
                is_enabled: is_enabled != 0,
            });
        }
        Ok(out)
    }

    /// Inserts a new schedule (when `schedule.id <= 0`) or replaces an
    /// existing one, returning the row id.
    pub fn save_schedule(&self, schedule: &Schedule) -> Result<i64> {
        let (rule_type, limit_dl, limit_ul, priority, quota_dl, quota_ul, quota_period) = match schedule.rule {
            RuleType::Limit { download_kbps, upload_kbps, priority } => {
                ("limit", Some(download_kbps as i64), Some(upload_kbps as i64), Some(priority as i64), None, None, None)
            }
            RuleType::Quota { limit_dl_bytes, limit_ul_bytes, period_seconds } => (
                "quota",
                None,
                None,
                None,
                Some(limit_dl_bytes as i64),
                Some(limit_ul_bytes as i64),
                period_seconds.map(|p| p as i64),
            ),
        };
        let custom_days = match &schedule.repeat_mode {
            RepeatMode::Custom { days } => Some(serde_json::to_string(days)?),
            _ => None,
        };

        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            if schedule.id > 0 {
                conn.execute(
                    "INSERT OR REPLACE INTO schedules(id, name, device_ip, rule_type, start_date, end_date,
                        start_time, end_time, repeat_mode, custom_days, limit_dl_kbps, limit_ul_kbps, priority,
                        quota_dl_bytes, quota_ul_bytes, quota_period_seconds, is_enabled)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                    params![
                        schedule.id,
                        schedule.name,
                        schedule.device_ip.to_string(),
                        rule_type,
                        schedule.start_date.map(|d| d.format(DATE_FMT).to_string()),
                        schedule.end_date.map(|d| d.format(DATE_FMT).to_string()),
                        schedule.start_time.format(TIME_FMT).to_string(),
                        schedule.end_time.format(TIME_FMT).to_string(),
                        repeat_mode_tag(&schedule.repeat_mode),
                        custom_days,
                        limit_dl,
                        limit_ul,
                        priority,
                        quota_dl,
                        quota_ul,
                        quota_period,
                        schedule.is_enabled as i64,
                    ],
                )?;
                Ok(schedule.id)
            } else {
                conn.execute(
                    "INSERT INTO schedules(name, device_ip, rule_type, start_date, end_date, start_time, end_time,
                        repeat_mode, custom_days, limit_dl_kbps, limit_ul_kbps, priority, quota_dl_bytes,
                        quota_ul_bytes, quota_period_seconds, is_enabled)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                    params![
                        schedule.name,
                        schedule.device_ip.to_string(),
                        rule_type,
                        schedule.start_date.map(|d| d.format(DATE_FMT).to_string()),
                        schedule.end_date.map(|d| d.format(DATE_FMT).to_string()),
                        schedule.start_time.format(TIME_FMT).to_string(),
                        schedule.end_time.format(TIME_FMT).to_string(),
                        repeat_mode_tag(&schedule.repeat_mode),
                        custom_days,
                        limit_dl,
                        limit_ul,
                        priority,
                        quota_dl,
                        quota_ul,
                        quota_period,
                        schedule.is_enabled as i64,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        })
    }

    pub fn delete_schedule(&self, id: i64) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn set_schedule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute("UPDATE schedules SET is_enabled = ?2 WHERE id = ?1", params![id, enabled as i64])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schedule() -> Schedule {
        Schedule {
            id: 0,
            name: "evening cap".to_string(),
            device_ip: "192.168.12.50".parse().unwrap(),
            rule: RuleType::Limit { download_kbps: 128, upload_kbps: 64, priority: 7 },
            start_date: None,
            end_date: None,
            start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            repeat_mode: RepeatMode::Daily,
            is_enabled: true,
        }
    }

    #[test]
    fn roundtrips_a_schedule() {
        let store = Store::open_in_memory().unwrap();
        let id = store.save_schedule(&sample_schedule()).unwrap();
        assert!(id > 0);
        let loaded = store.load_schedules().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, id);
        assert!(matches!(loaded[0].rule, RuleType::Limit { download_kbps: 128, .. }));

        store.set_schedule_enabled(id, false).unwrap();
        assert!(!store.load_schedules().unwrap()[0].is_enabled);

        store.delete_schedule(id).unwrap();
        assert!(store.load_schedules().unwrap().is_empty());
    }

    #[test]
    fn custom_repeat_days_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut schedule = sample_schedule();
        schedule.repeat_mode = RepeatMode::Custom { days: [true, false, true, false, true, false, true] };
        let id = store.save_schedule(&schedule).unwrap();
        let loaded = store.load_schedules().unwrap();
        let found = loaded.iter().find(|s| s.id == id).unwrap();
        assert!(matches!(found.repeat_mode, RepeatMode::Custom { days } if days[0] && !days[1]));
    }
}
