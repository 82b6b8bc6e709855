//! The reading pipeline: plot lookup (with auto-provisioning), persistence,
//! scoring, daily statistics, then the alert decision.

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::db::{Plot, ZoneDailyStat};
use crate::irrigation::{evaluate, Evaluation};
use crate::state::AppState;
use crate::stats;

/// Ideal moisture given to plots created on first contact.
pub const DEFAULT_IDEAL_MOISTURE: i64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct ReadingResponse {
    pub id: String,
    pub plot_id: String,
    pub moisture: i64,
    pub light: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(flatten)]
    pub evaluation: Evaluation,
}

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    #[serde(flatten)]
    pub reading: ReadingResponse,
    pub daily_stat: ZoneDailyStat,
    pub plot_provisioned: bool,
    pub alert_dispatched: bool,
}

fn default_plot(plot_id: &str) -> Plot {
    Plot {
        plot_id: plot_id.to_string(),
        name: "Auto-provisioned zone".to_string(),
        crop_type: "Unknown".to_string(),
        ideal_moisture: DEFAULT_IDEAL_MOISTURE,
    }
}

/// Accept one sensor reading. `plot_id` must already be in canonical form.
///
/// The raw reading is committed before the daily stat is updated and is
/// kept if that update fails. The caller then gets an error and the day's
/// row is short one reading; `readings` remains the complete record.
pub async fn ingest(
    state: &AppState,
    plot_id: &str,
    moisture: i64,
    light: i64,
) -> Result<IngestOutcome> {
    let (plot, provisioned) = match state.db.get_plot(plot_id).await? {
        Some(p) => (p, false),
        None => {
            let p = state.db.insert_plot(&default_plot(plot_id)).await?;
            info!(zone = %plot_id, ideal = p.ideal_moisture, "auto-provisioned plot");
            state.activity.write().await.record_provisioned(plot_id);
            (p, true)
        }
    };

    let now = OffsetDateTime::now_utc();
    let reading_id = Uuid::new_v4().to_string();
    state
        .db
        .insert_reading(&reading_id, &plot.plot_id, moisture, light, now.unix_timestamp())
        .await?;

    let evaluation = evaluate(moisture, plot.ideal_moisture);

    let daily_stat = stats::record_reading(
        &state.db,
        &plot.plot_id,
        moisture,
        plot.ideal_moisture,
        now.date(),
    )
    .await?;

    let alert = state
        .alerter
        .maybe_alert(&plot, moisture, &evaluation, now.unix_timestamp())
        .await;
    let alert_dispatched = alert.dispatched();

    {
        let mut activity = state.activity.write().await;
        activity.record_reading(format!(
            "{}: moisture={moisture} light={light} score={} {:?}",
            plot.plot_id, evaluation.score, evaluation.status
        ));
        if alert_dispatched {
            activity.record_alert(format!("{}: {:?}", plot.plot_id, evaluation.status));
        }
    }

    Ok(IngestOutcome {
        reading: ReadingResponse {
            id: reading_id,
            plot_id: plot.plot_id,
            moisture,
            light,
            created_at: now,
            evaluation,
        },
        daily_stat,
        plot_provisioned: provisioned,
        alert_dispatched,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
