//! Per-zone daily statistics: running-average upsert and the savings
//! summary served to the statistics dashboard.
//!
//! Savings are estimated against a fixed daily baseline for a notional
//! 100 m² zone. They are always recomputed from the day's running average
//! (never accumulated per reading), so a stat row reports "what today has
//! saved if the rest of the day looks like it has so far".

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use time::{Date, Duration};
use tracing::debug;

use crate::db::{day_key, Db, ZoneDailyStat};

/// Litres per m² per day a timer-driven system would apply.
pub const BASELINE_RATE: f64 = 5.0;
/// Notional zone size in m².
pub const ZONE_AREA: f64 = 100.0;
/// £ per litre of mains water.
pub const WATER_COST_PER_L: f64 = 0.003;
/// Pump runtime per litre delivered, in hours.
pub const PUMP_HOURS_PER_L: f64 = 0.0005;
/// Pump power draw in kW.
pub const PUMP_KW: f64 = 0.75;
/// £ per kWh.
pub const ENERGY_COST_PER_KWH: f64 = 0.28;

pub const MIN_SUMMARY_DAYS: i64 = 1;
pub const MAX_SUMMARY_DAYS: i64 = 365;

/// Lost compare-and-swap races before giving up on a single reading.
const MAX_UPSERT_ATTEMPTS: usize = 64;

// ---------------------------------------------------------------------------
// Savings model
// ---------------------------------------------------------------------------

pub fn baseline_liters() -> f64 {
    BASELINE_RATE * ZONE_AREA
}

/// Fraction of the baseline still needed to bring `avg` up to `ideal`.
pub fn deficit_fraction(ideal: i64, avg_moisture: f64) -> f64 {
    if ideal == 0 {
        return 0.0;
    }
    let ideal = ideal as f64;
    ((ideal - avg_moisture) / ideal).max(0.0)
}

/// Raw (untruncated) ratio check used for the optimal-reading tally.
pub fn in_optimal_band(moisture: i64, ideal: i64) -> bool {
    if ideal == 0 {
        return false;
    }
    let score = moisture as f64 / ideal as f64 * 100.0;
    (80.0..=120.0).contains(&score)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Savings {
    pub water_l: f64,
    pub cost_gbp: f64,
    pub energy_kwh: f64,
}

impl Savings {
    pub fn from_average(avg_moisture: f64, ideal: i64) -> Self {
        let baseline = baseline_liters();
        let actual = baseline * deficit_fraction(ideal, avg_moisture);
        let saved = (baseline - actual).max(0.0);

        let energy_kwh = saved * PUMP_HOURS_PER_L * PUMP_KW;
        let cost_gbp = saved * WATER_COST_PER_L + energy_kwh * ENERGY_COST_PER_KWH;

        Self {
            water_l: saved,
            cost_gbp,
            energy_kwh,
        }
    }
}

impl ZoneDailyStat {
    /// The read-modify-write step for one new reading.
    ///
    /// The stored ideal follows the latest reading's plot configuration, so
    /// it can change mid-day if the plot is reconfigured.
    pub fn with_reading(&self, moisture: i64, ideal: i64) -> Self {
        let n = self.reading_count as f64;
        let avg_moisture = (self.avg_moisture * n + moisture as f64) / (n + 1.0);
        let savings = Savings::from_average(avg_moisture, ideal);

        Self {
            plot_id: self.plot_id.clone(),
            stat_date: self.stat_date.clone(),
            reading_count: self.reading_count + 1,
            avg_moisture,
            ideal_moisture: ideal,
            water_saved_l: savings.water_l,
            cost_saved_gbp: savings.cost_gbp,
            energy_saved_kwh: savings.energy_kwh,
            optimal_readings: self.optimal_readings + i64::from(in_optimal_band(moisture, ideal)),
        }
    }
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

/// Fold one reading into the (plot, day) accumulator and return the new row.
///
/// Concurrent calls for the same key are serialised with a compare-and-swap
/// on `reading_count`; a lost race re-reads the row and tries again.
pub async fn record_reading(
    db: &Db,
    plot_id: &str,
    moisture: i64,
    ideal: i64,
    day: Date,
) -> Result<ZoneDailyStat> {
    let day = day_key(day);
    db.ensure_zone_stat(plot_id, &day, ideal).await?;

    for attempt in 1..=MAX_UPSERT_ATTEMPTS {
        let current = db
            .get_zone_stat(plot_id, &day)
            .await?
            .with_context(|| format!("zone stat {plot_id}/{day} vanished"))?;

        let next = current.with_reading(moisture, ideal);
        if db.compare_and_swap_zone_stat(&current, &next).await? {
            return Ok(next);
        }

        debug!(zone = %plot_id, day = %day, attempt, "zone stat update lost a race, retrying");
        tokio::task::yield_now().await;
    }

    bail!("zone stat {plot_id}/{day}: gave up after {MAX_UPSERT_ATTEMPTS} conflicting updates")
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryReport {
    pub period_days: i64,
    pub total_water_saved_l: f64,
    pub total_cost_saved_gbp: f64,
    pub total_energy_saved_kwh: f64,
    pub overall_optimal_pct: f64,
    pub daily_breakdown: Vec<DailyBreakdown>,
    pub zone_breakdown: Vec<ZoneBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyBreakdown {
    pub date: String,
    pub baseline_l: f64,
    pub actual_l: f64,
    pub saved_l: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneBreakdown {
    pub plot_id: String,
    pub efficiency_pct: f64,
    pub water_saved_l: f64,
}

pub fn clamp_days(days: i64) -> i64 {
    days.clamp(MIN_SUMMARY_DAYS, MAX_SUMMARY_DAYS)
}

/// Savings summary for the stat rows from `today - days` onwards.
pub async fn summarize(db: &Db, days: i64, today: Date) -> Result<SummaryReport> {
    let days = clamp_days(days);
    let first_day = today
        .checked_sub(Duration::days(days))
        .unwrap_or(Date::MIN);
    let rows = db.zone_stats_since(&day_key(first_day)).await?;
    Ok(build_summary(&rows, days))
}

/// Roll stat rows up into totals plus per-day and per-zone breakdowns.
///
/// Daily entries round each row to 1 dp before summing, so day totals
/// carry per-row rounding error. Existing dashboards expect exactly these
/// numbers.
// TODO: switch daily entries to sum-then-round once the dashboard charts
// are regenerated from raw rows.
pub fn build_summary(rows: &[ZoneDailyStat], days: i64) -> SummaryReport {
    if rows.is_empty() {
        return SummaryReport {
            period_days: days,
            total_water_saved_l: 0.0,
            total_cost_saved_gbp: 0.0,
            total_energy_saved_kwh: 0.0,
            overall_optimal_pct: 0.0,
            daily_breakdown: Vec::new(),
            zone_breakdown: Vec::new(),
        };
    }

    let mut water = 0.0;
    let mut cost = 0.0;
    let mut energy = 0.0;
    let mut readings = 0_i64;
    let mut optimal = 0_i64;

    let mut by_day: BTreeMap<&str, DailyBreakdown> = BTreeMap::new();
    let mut zone_index: HashMap<&str, usize> = HashMap::new();
    let mut zones: Vec<ZoneAcc> = Vec::new();

    for row in rows {
        water += row.water_saved_l;
        cost += row.cost_saved_gbp;
        energy += row.energy_saved_kwh;
        readings += row.reading_count;
        optimal += row.optimal_readings;

        let baseline = baseline_liters();
        let actual = baseline * deficit_fraction(row.ideal_moisture, row.avg_moisture);
        let day = by_day
            .entry(row.stat_date.as_str())
            .or_insert_with(|| DailyBreakdown {
                date: row.stat_date.clone(),
                baseline_l: 0.0,
                actual_l: 0.0,
                saved_l: 0.0,
            });
        day.baseline_l += round1(baseline);
        day.actual_l += round1(actual);
        day.saved_l += round1(row.water_saved_l);

        let idx = *zone_index.entry(row.plot_id.as_str()).or_insert_with(|| {
            zones.push(ZoneAcc {
                plot_id: row.plot_id.clone(),
                water_saved_l: 0.0,
                readings: 0,
                optimal: 0,
            });
            zones.len() - 1
        });
        let zone = &mut zones[idx];
        zone.water_saved_l += row.water_saved_l;
        zone.readings += row.reading_count;
        zone.optimal += row.optimal_readings;
    }

    let daily_breakdown = by_day
        .into_values()
        .map(|d| DailyBreakdown {
            baseline_l: round1(d.baseline_l),
            actual_l: round1(d.actual_l),
            saved_l: round1(d.saved_l),
            ..d
        })
        .collect();

    let zone_breakdown = zones
        .into_iter()
        .map(|z| ZoneBreakdown {
            efficiency_pct: round1(percent(z.optimal, z.readings)),
            water_saved_l: round1(z.water_saved_l),
            plot_id: z.plot_id,
        })
        .collect();

    SummaryReport {
        period_days: days,
        total_water_saved_l: round1(water),
        total_cost_saved_gbp: round2(cost),
        total_energy_saved_kwh: round2(energy),
        overall_optimal_pct: round1(percent(optimal, readings)),
        daily_breakdown,
        zone_breakdown,
    }
}

struct ZoneAcc {
    plot_id: String,
    water_saved_l: f64,
    readings: i64,
    optimal: i64,
}

fn percent(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================
