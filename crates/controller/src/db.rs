use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use crate::clock::{format_timestamp, Timestamp};
use crate::snapshot::{Snapshot, SNAPSHOT_VERSION};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Why a run started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    Schedule,
    Manual,
}

impl RunReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunReason::Schedule => "schedule",
            RunReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringEvent {
    pub station: u8,
    pub ts_start: String,
    pub ts_end: String,
    pub minutes: u32,
    pub applied_mm: f64,
    pub liters: f64,
    pub reason: String,
    /// `completed` or `interrupted`.
    pub result: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/controller.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Snapshot
    // ----------------------------

    pub async fn load_snapshot(&self, controller_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query("SELECT version, data FROM snapshots WHERE controller_id = ?")
            .bind(controller_id)
            .fetch_optional(&self.pool)
            .await
            .context("load_snapshot failed")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.try_get("version")?;
        if version > SNAPSHOT_VERSION {
            bail!("snapshot version {version} is newer than supported ({SNAPSHOT_VERSION})");
        }
        let data: String = row.try_get("data")?;
        let snap = serde_json::from_str(&data).context("snapshot data is not valid JSON")?;
        Ok(Some(snap))
    }

    pub async fn save_snapshot(&self, controller_id: &str, snap: &Snapshot, now: &Timestamp) -> Result<()> {
        let data = serde_json::to_string(snap).context("serialize snapshot")?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (controller_id, version, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(controller_id) DO UPDATE SET
              version=excluded.version,
              data=excluded.data,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(controller_id)
        .bind(SNAPSHOT_VERSION)
        .bind(data)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await
        .context("save_snapshot failed")?;
        Ok(())
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn insert_watering_event(&self, controller_id: &str, ev: &WateringEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events (
              controller_id, station, ts_start, ts_end,
              minutes, applied_mm, liters, reason, result
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(controller_id)
        .bind(i64::from(ev.station))
        .bind(&ev.ts_start)
        .bind(&ev.ts_end)
        .bind(i64::from(ev.minutes))
        .bind(ev.applied_mm)
        .bind(ev.liters)
        .bind(&ev.reason)
        .bind(&ev.result)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_watering_events(&self, controller_id: &str, limit: i64) -> Result<Vec<WateringEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT station, ts_start, ts_end, minutes, applied_mm, liters, reason, result
            FROM watering_events
            WHERE controller_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(controller_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_watering_events failed")?;

        rows.into_iter()
            .map(|r| -> Result<WateringEvent> {
                let station: i64 = r.try_get("station")?;
                let minutes: i64 = r.try_get("minutes")?;
                Ok(WateringEvent {
                    station: u8::try_from(station).context("station out of range")?,
                    ts_start: r.try_get("ts_start")?,
                    ts_end: r.try_get("ts_end")?,
                    minutes: u32::try_from(minutes).context("minutes out of range")?,
                    applied_mm: r.try_get("applied_mm")?,
                    liters: r.try_get("liters")?,
                    reason: r.try_get("reason")?,
                    result: r.try_get("result")?,
                })
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ts;
    use chrono_tz::Tz;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn snapshot(manual: u32) -> Snapshot {
        serde_json::from_value(serde_json::json!({
            "irrigation_manual_duration": manual,
            "water_flow_rate": [12.0, 8.5],
            "last_reset": "2024-06-10 00:00:00",
        }))
        .unwrap()
    }

    fn event(station: u8, result: &str) -> WateringEvent {
        WateringEvent {
            station,
            ts_start: "2024-06-10 06:00:00".into(),
            ts_end: "2024-06-10 06:10:00".into(),
            minutes: 10,
            applied_mm: 12.0,
            liters: 120.0,
            reason: RunReason::Schedule.as_str().into(),
            result: result.into(),
        }
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let db = test_db().await;
        assert!(db.load_snapshot("aabbccddeeff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_upsert_replaces_row() {
        let db = test_db().await;
        let now = ts(Tz::UTC, "2024-06-10 12:00:00");

        db.save_snapshot("aabbccddeeff", &snapshot(15), &now).await.unwrap();
        db.save_snapshot("aabbccddeeff", &snapshot(20), &now).await.unwrap();

        let loaded = db.load_snapshot("aabbccddeeff").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot(20));
        assert!(db.load_snapshot("112233445566").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn newer_snapshot_version_is_rejected() {
        let db = test_db().await;
        sqlx::query("INSERT INTO snapshots VALUES ('x', 99, '{}', '2024-06-10 00:00:00')")
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(db.load_snapshot("x").await.is_err());
    }

    #[tokio::test]
    async fn watering_events_newest_first_per_controller() {
        let db = test_db().await;
        db.insert_watering_event("a", &event(1, "completed")).await.unwrap();
        db.insert_watering_event("a", &event(2, "interrupted")).await.unwrap();
        db.insert_watering_event("b", &event(1, "completed")).await.unwrap();

        let events = db.recent_watering_events("a", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], event(2, "interrupted"));
        assert_eq!(events[1].station, 1);

        assert_eq!(db.recent_watering_events("a", 1).await.unwrap().len(), 1);
    }
}
