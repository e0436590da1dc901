use anyhow::Result;
use hg_api_types::ForecastPoint;
use rusqlite::params;

use crate::Store;

impl Store {
    /// Appends one raw per-tick delta to the usage log. Called only when the
    /// delta is non-zero.
    pub fn log_usage(&self, timestamp: &str, ip: &str, rx_bytes: u64, tx_bytes: u64) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO data_log(timestamp, ip_address, rx_bytes, tx_bytes) VALUES (?1, ?2, ?3, ?4)",
                params![timestamp, ip, rx_bytes as i64, tx_bytes as i64],
            )?;
            Ok(())
        })
    }

    pub fn record_usage_summary(&self, timestamp: &str, total_rx_bytes: u64, total_tx_bytes: u64) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO usage_summary(timestamp, total_rx_bytes, total_tx_bytes) VALUES (?1, ?2, ?3)
                 ON CONFLICT(timestamp) DO UPDATE SET total_rx_bytes = excluded.total_rx_bytes,
                    total_tx_bytes = excluded.total_tx_bytes",
                params![timestamp, total_rx_bytes as i64, total_tx_bytes as i64],
            )?;
            Ok(())
        })
    }

    /// Sum of `rx_bytes`/`tx_bytes` from `data_log` between two ISO-8601
    /// timestamps (inclusive); the external forecast trainer re-derives
    /// `usage_summary` from this.
    pub fn historical_totals(&self, from_ts: &str, to_ts: &str) -> Result<(u64, u64)> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(SUM(rx_bytes), 0), COALESCE(SUM(tx_bytes), 0) FROM data_log
             WHERE timestamp >= ?1 AND timestamp <= ?2",
            params![from_ts, to_ts],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )
        .map_err(Into::into)
    }

    /// Writes one forecast point. In production this table is populated by
    /// the external forecast trainer, not this daemon; exposed here so test
    /// fixtures (and a future in-process trainer) can populate it without
    /// reaching into the connection directly.
    pub fn save_forecast_point(&self, timestamp: &str, predicted_bytes: f64, predicted_lower: Option<f64>, predicted_upper: Option<f64>) -> Result<()> {
        self.with_write_lock(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO usage_forecast(timestamp, predicted_bytes, predicted_lower, predicted_upper) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(timestamp) DO UPDATE SET predicted_bytes = excluded.predicted_bytes,
                    predicted_lower = excluded.predicted_lower, predicted_upper = excluded.predicted_upper",
                params![timestamp, predicted_bytes, predicted_lower, predicted_upper],
            )?;
            Ok(())
        })
    }

    /// Read-only from this crate's point of view: `usage_forecast` is
    /// written by the external forecast trainer.
    pub fn load_forecast(&self, from_ts: i64, to_ts: i64) -> Result<Vec<ForecastPoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT CAST(timestamp AS INTEGER), predicted_bytes FROM usage_forecast
             WHERE CAST(timestamp AS INTEGER) > ?1 AND CAST(timestamp AS INTEGER) <= ?2
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![from_ts, to_ts], |row| {
            let timestamp: i64 = row.get(0)?;
            let predicted_bytes: f64 = row.get(1)?;
            Ok(ForecastPoint { timestamp, predicted_bytes })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_totals_match_logged_deltas() {
        let store = Store::open_in_memory().unwrap();
        store.log_usage("2026-01-01T00:00:00", "192.168.12.25", 100, 50).unwrap();
        store.log_usage("2026-01-01T00:00:01", "192.168.12.25", 200, 70).unwrap();
        let (rx, tx) = store.historical_totals("2026-01-01T00:00:00", "2026-01-01T00:00:01").unwrap();
        assert_eq!(rx, 300);
        assert_eq!(tx, 120);
    }

    #[test]
    fn forecast_window_is_exclusive_of_now() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO usage_forecast(timestamp, predicted_bytes) VALUES (?1, ?2)",
                params!["1700000900", 1.2e9],
            )
            .unwrap();
        let points = store.load_forecast(1_700_000_000, 1_700_004_600).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].predicted_bytes, 1.2e9);
    }
}
