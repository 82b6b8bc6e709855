use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::{Date, OffsetDateTime};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Plot {
    pub plot_id: String,
    pub name: String,
    pub crop_type: String,
    pub ideal_moisture: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredReading {
    pub reading_id: String,
    pub plot_id: String,
    pub moisture: i64,
    pub light: i64,
    pub created_ts: i64,
    /// Ideal moisture of the owning plot at query time.
    pub ideal_moisture: i64,
}

/// Per-plot, per-day accumulator row.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ZoneDailyStat {
    pub plot_id: String,
    pub stat_date: String, // YYYY-MM-DD
    pub reading_count: i64,
    pub avg_moisture: f64,
    pub ideal_moisture: i64,
    pub water_saved_l: f64,
    pub cost_saved_gbp: f64,
    pub energy_saved_kwh: f64,
    pub optimal_readings: i64,
}

/// Calendar-day key used for `zone_stats.stat_date`.
pub fn day_key(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    )
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:orchard.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database,
        // so tests get exactly one connection that never expires.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
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
    // Plots
    // ----------------------------

    pub async fn get_plot(&self, plot_id: &str) -> Result<Option<Plot>> {
        sqlx::query_as::<_, Plot>(
            r#"
            SELECT plot_id, name, crop_type, ideal_moisture
            FROM plots
            WHERE plot_id = ?
            "#,
        )
        .bind(plot_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plot failed")
    }

    pub async fn load_plots(&self) -> Result<Vec<Plot>> {
        sqlx::query_as::<_, Plot>(
            r#"
            SELECT plot_id, name, crop_type, ideal_moisture
            FROM plots
            ORDER BY name, plot_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_plots failed")
    }

    /// Insert a plot unless one with the same id already exists. Returns the
    /// row that is stored afterwards, which is the existing one if another
    /// request provisioned it first.
    pub async fn insert_plot(&self, p: &Plot) -> Result<Plot> {
        sqlx::query(
            r#"
            INSERT INTO plots (plot_id, name, crop_type, ideal_moisture)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(plot_id) DO NOTHING
            "#,
        )
        .bind(&p.plot_id)
        .bind(&p.name)
        .bind(&p.crop_type)
        .bind(p.ideal_moisture)
        .execute(&self.pool)
        .await
        .context("insert_plot failed")?;

        self.get_plot(&p.plot_id)
            .await?
            .with_context(|| format!("plot '{}' missing after insert", p.plot_id))
    }

    pub async fn upsert_plot(&self, p: &Plot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plots (plot_id, name, crop_type, ideal_moisture)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(plot_id) DO UPDATE SET
              name=excluded.name,
              crop_type=excluded.crop_type,
              ideal_moisture=excluded.ideal_moisture
            "#,
        )
        .bind(&p.plot_id)
        .bind(&p.name)
        .bind(&p.crop_type)
        .bind(p.ideal_moisture)
        .execute(&self.pool)
        .await
        .context("upsert_plot failed")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(
        &self,
        reading_id: &str,
        plot_id: &str,
        moisture: i64,
        light: i64,
        created_ts: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (reading_id, plot_id, moisture, light, created_ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading_id)
        .bind(plot_id)
        .bind(moisture)
        .bind(light)
        .bind(created_ts)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest readings first, across all plots.
    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<StoredReading>> {
        sqlx::query_as::<_, StoredReading>(
            r#"
            SELECT r.reading_id, r.plot_id, r.moisture, r.light, r.created_ts,
                   p.ideal_moisture
            FROM readings r
            JOIN plots p ON p.plot_id = r.plot_id
            ORDER BY r.created_ts DESC, r.rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")
    }

    // ----------------------------
    // Zone daily stats
    // ----------------------------

    pub async fn get_zone_stat(&self, plot_id: &str, day: &str) -> Result<Option<ZoneDailyStat>> {
        sqlx::query_as::<_, ZoneDailyStat>(
            r#"
            SELECT plot_id, stat_date, reading_count, avg_moisture, ideal_moisture,
                   water_saved_l, cost_saved_gbp, energy_saved_kwh, optimal_readings
            FROM zone_stats
            WHERE plot_id = ? AND stat_date = ?
            "#,
        )
        .bind(plot_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .context("get_zone_stat failed")
    }

    /// Create the empty accumulator row for (plot, day) if it does not exist.
    pub async fn ensure_zone_stat(&self, plot_id: &str, day: &str, ideal: i64) -> Result<()> {
        let now = now_unix();
        sqlx::query(
            r#"
            INSERT INTO zone_stats (
              plot_id, stat_date, reading_count, avg_moisture, ideal_moisture,
              water_saved_l, cost_saved_gbp, energy_saved_kwh, optimal_readings,
              created_ts, updated_ts
            ) VALUES (?, ?, 0, 0.0, ?, 0.0, 0.0, 0.0, 0, ?, ?)
            ON CONFLICT(plot_id, stat_date) DO NOTHING
            "#,
        )
        .bind(plot_id)
        .bind(day)
        .bind(ideal)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("ensure_zone_stat failed")?;
        Ok(())
    }

    /// Write `next` only if the stored row still has `current.reading_count`.
    ///
    /// `reading_count` only ever grows, so it doubles as a row version.
    /// Returns false when another writer got there first.
    pub async fn compare_and_swap_zone_stat(
        &self,
        current: &ZoneDailyStat,
        next: &ZoneDailyStat,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE zone_stats SET
              reading_count = ?,
              avg_moisture = ?,
              ideal_moisture = ?,
              water_saved_l = ?,
              cost_saved_gbp = ?,
              energy_saved_kwh = ?,
              optimal_readings = ?,
              updated_ts = ?
            WHERE plot_id = ? AND stat_date = ? AND reading_count = ?
            "#,
        )
        .bind(next.reading_count)
        .bind(next.avg_moisture)
        .bind(next.ideal_moisture)
        .bind(next.water_saved_l)
        .bind(next.cost_saved_gbp)
        .bind(next.energy_saved_kwh)
        .bind(next.optimal_readings)
        .bind(now_unix())
        .bind(&current.plot_id)
        .bind(&current.stat_date)
        .bind(current.reading_count)
        .execute(&self.pool)
        .await
        .context("compare_and_swap_zone_stat failed")?;

        Ok(res.rows_affected() == 1)
    }

    /// All stat rows on or after `first_day`, oldest day first, rows within a
    /// day in creation order.
    pub async fn zone_stats_since(&self, first_day: &str) -> Result<Vec<ZoneDailyStat>> {
        sqlx::query_as::<_, ZoneDailyStat>(
            r#"
            SELECT plot_id, stat_date, reading_count, avg_moisture, ideal_moisture,
                   water_saved_l, cost_saved_gbp, energy_saved_kwh, optimal_readings
            FROM zone_stats
            WHERE stat_date >= ?
            ORDER BY stat_date, id
            "#,
        )
        .bind(first_day)
        .fetch_all(&self.pool)
        .await
        .context("zone_stats_since failed")
    }

    // ----------------------------
    // Alert cooldowns
    // ----------------------------

    #[cfg(test)]
    pub(crate) async fn last_alert_ts(&self, plot_id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT last_sent_ts FROM alert_cooldowns WHERE plot_id = ?
            "#,
        )
        .bind(plot_id)
        .fetch_optional(&self.pool)
        .await
        .context("last_alert_ts failed")
    }

    /// Atomically stamp `now` as the plot's last alert, but only if the
    /// previous one (if any) is at or before `not_after`. Returns true when
    /// this caller won the claim.
    pub async fn claim_alert(&self, plot_id: &str, now: i64, not_after: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO alert_cooldowns (plot_id, last_sent_ts)
            VALUES (?, ?)
            ON CONFLICT(plot_id) DO UPDATE SET last_sent_ts=excluded.last_sent_ts
            WHERE alert_cooldowns.last_sent_ts <= ?
            "#,
        )
        .bind(plot_id)
        .bind(now)
        .bind(not_after)
        .execute(&self.pool)
        .await
        .context("claim_alert failed")?;
        Ok(res.rows_affected() == 1)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn plot(id: &str, ideal: i64) -> Plot {
        Plot {
            plot_id: id.into(),
            name: format!("Plot {id}"),
            crop_type: "Tomatoes".into(),
            ideal_moisture: ideal,
        }
    }

    #[test]
    fn day_key_is_zero_padded() {
        assert_eq!(day_key(date!(2026 - 03 - 07)), "2026-03-07");
        assert_eq!(day_key(date!(2026 - 12 - 31)), "2026-12-31");
    }

    #[tokio::test]
    async fn insert_plot_keeps_existing_row() {
        let db = test_db().await;
        db.insert_plot(&plot("p1", 70)).await.unwrap();

        let stored = db.insert_plot(&plot("p1", 60)).await.unwrap();
        assert_eq!(stored.ideal_moisture, 70);
    }

    #[tokio::test]
    async fn upsert_plot_overwrites() {
        let db = test_db().await;
        db.upsert_plot(&plot("p1", 70)).await.unwrap();
        db.upsert_plot(&plot("p1", 55)).await.unwrap();

        let p = db.get_plot("p1").await.unwrap().unwrap();
        assert_eq!(p.ideal_moisture, 55);
        assert_eq!(db.load_plots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_missing_plot_is_none() {
        let db = test_db().await;
        assert!(db.get_plot("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reading_requires_known_plot() {
        let db = test_db().await;
        let err = db.insert_reading("r1", "ghost", 40, 300, 1).await;
        assert!(err.is_err(), "foreign key should reject unknown plot");
    }

    #[tokio::test]
    async fn recent_readings_newest_first() {
        let db = test_db().await;
        db.insert_plot(&plot("p1", 60)).await.unwrap();
        db.insert_reading("r1", "p1", 10, 200, 100).await.unwrap();
        db.insert_reading("r2", "p1", 20, 300, 200).await.unwrap();
        db.insert_reading("r3", "p1", 30, 400, 300).await.unwrap();

        let rows = db.recent_readings(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reading_id, "r3");
        assert_eq!(rows[1].reading_id, "r2");
        assert_eq!(rows[0].ideal_moisture, 60);
    }

    #[tokio::test]
    async fn ensure_zone_stat_is_idempotent() {
        let db = test_db().await;
        db.insert_plot(&plot("p1", 60)).await.unwrap();
        db.ensure_zone_stat("p1", "2026-10-18", 60).await.unwrap();
        db.ensure_zone_stat("p1", "2026-10-18", 99).await.unwrap();

        let row = db.get_zone_stat("p1", "2026-10-18").await.unwrap().unwrap();
        assert_eq!(row.reading_count, 0);
        assert_eq!(row.ideal_moisture, 60);
        assert_eq!(db.zone_stats_since("2026-01-01").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_compare_and_swap_is_rejected() {
        let db = test_db().await;
        db.insert_plot(&plot("p1", 60)).await.unwrap();
        db.ensure_zone_stat("p1", "2026-10-18", 60).await.unwrap();
        let current = db.get_zone_stat("p1", "2026-10-18").await.unwrap().unwrap();

        let next = ZoneDailyStat {
            reading_count: 1,
            avg_moisture: 42.0,
            ..current.clone()
        };
        assert!(db.compare_and_swap_zone_stat(&current, &next).await.unwrap());
        // Same expected version again: someone already moved the row on.
        assert!(!db.compare_and_swap_zone_stat(&current, &next).await.unwrap());

        let row = db.get_zone_stat("p1", "2026-10-18").await.unwrap().unwrap();
        assert_eq!(row.reading_count, 1);
        assert_eq!(row.avg_moisture, 42.0);
    }

    #[tokio::test]
    async fn zone_stats_since_filters_and_orders() {
        let db = test_db().await;
        db.insert_plot(&plot("a", 60)).await.unwrap();
        db.insert_plot(&plot("b", 60)).await.unwrap();
        db.ensure_zone_stat("b", "2026-10-17", 60).await.unwrap();
        db.ensure_zone_stat("a", "2026-10-10", 60).await.unwrap();
        db.ensure_zone_stat("a", "2026-10-17", 60).await.unwrap();
        db.ensure_zone_stat("a", "2026-10-16", 60).await.unwrap();

        let rows = db.zone_stats_since("2026-10-16").await.unwrap();
        let keys: Vec<_> = rows
            .iter()
            .map(|r| (r.stat_date.as_str(), r.plot_id.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("2026-10-16", "a"), ("2026-10-17", "b"), ("2026-10-17", "a")]
        );
    }

    #[tokio::test]
    async fn alert_claim_respects_window() {
        let db = test_db().await;
        db.insert_plot(&plot("p1", 60)).await.unwrap();
        assert_eq!(db.last_alert_ts("p1").await.unwrap(), None);

        // First claim always wins.
        assert!(db.claim_alert("p1", 1_000, 1_000 - 600).await.unwrap());
        // Inside the window: refused, timestamp untouched.
        assert!(!db.claim_alert("p1", 1_300, 1_300 - 600).await.unwrap());
        assert_eq!(db.last_alert_ts("p1").await.unwrap(), Some(1_000));
        // Window elapsed exactly: allowed.
        assert!(db.claim_alert("p1", 1_600, 1_600 - 600).await.unwrap());
        assert_eq!(db.last_alert_ts("p1").await.unwrap(), Some(1_600));
    }
}
