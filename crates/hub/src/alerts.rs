//! Cooldown-gated alert notifications for plots that are too dry or
//! oversaturated.
//!
//! Delivery goes through [`AlertDispatcher`] on a spawned task. Neither a
//! failed send nor a failed cooldown lookup can affect the reading or the
//! statistics update that triggered it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::{Db, Plot};
use crate::irrigation::{Evaluation, Status};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Rate limit for alerts, per plot.
#[async_trait]
pub trait CooldownGate: Send + Sync {
    /// Check and claim the plot's cooldown in one step. At most one of any
    /// set of concurrent callers gets `true`.
    async fn try_claim(&self, plot_id: &str, now: i64) -> Result<bool>;
}

/// Message transport (email in production).
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Cooldown backed by the `alert_cooldowns` table.
pub struct DbCooldown {
    db: Db,
    cooldown_secs: i64,
}

impl DbCooldown {
    pub fn new(db: Db, cooldown_min: i64) -> Self {
        Self {
            db,
            cooldown_secs: cooldown_min * 60,
        }
    }
}

#[async_trait]
impl CooldownGate for DbCooldown {
    async fn try_claim(&self, plot_id: &str, now: i64) -> Result<bool> {
        self.db
            .claim_alert(plot_id, now, now - self.cooldown_secs)
            .await
    }
}

/// Writes alerts to the log instead of sending them.
pub struct LogDispatcher;

#[async_trait]
impl AlertDispatcher for LogDispatcher {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        warn!(to = %recipient, subject = %subject, body = %body, "alert");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Optimal,
    NoRecipient,
    CoolingDown,
    GateFailed,
}

#[derive(Debug)]
pub enum AlertOutcome {
    Skipped(SkipReason),
    /// Send is running in the background.
    Dispatched(JoinHandle<()>),
}

impl AlertOutcome {
    pub fn dispatched(&self) -> bool {
        matches!(self, AlertOutcome::Dispatched(_))
    }
}

pub struct Alerter {
    recipient: Option<String>,
    gate: Arc<dyn CooldownGate>,
    dispatcher: Arc<dyn AlertDispatcher>,
}

impl Alerter {
    pub fn new(
        recipient: Option<String>,
        gate: Arc<dyn CooldownGate>,
        dispatcher: Arc<dyn AlertDispatcher>,
    ) -> Self {
        Self {
            recipient,
            gate,
            dispatcher,
        }
    }

    pub fn enabled(&self) -> bool {
        self.recipient.is_some()
    }

    /// Send an alert for this reading if its status needs one and the plot
    /// is out of cooldown.
    pub async fn maybe_alert(
        &self,
        plot: &Plot,
        moisture: i64,
        eval: &Evaluation,
        now: i64,
    ) -> AlertOutcome {
        if !eval.status.needs_attention() {
            return AlertOutcome::Skipped(SkipReason::Optimal);
        }
        let Some(recipient) = self.recipient.clone() else {
            return AlertOutcome::Skipped(SkipReason::NoRecipient);
        };

        // The claim happens before sending, so a failed send still uses up
        // the cooldown.
        match self.gate.try_claim(&plot.plot_id, now).await {
            Ok(true) => {}
            Ok(false) => return AlertOutcome::Skipped(SkipReason::CoolingDown),
            Err(e) => {
                warn!(zone = %plot.plot_id, "alert cooldown claim failed: {e:#}");
                return AlertOutcome::Skipped(SkipReason::GateFailed);
            }
        }

        let (subject, body) = compose(plot, moisture, eval);
        let dispatcher = Arc::clone(&self.dispatcher);
        let zone = plot.plot_id.clone();

        info!(zone = %zone, status = ?eval.status, score = eval.score, "dispatching alert");

        AlertOutcome::Dispatched(tokio::spawn(async move {
            if let Err(e) = dispatcher.send(&recipient, &subject, &body).await {
                warn!(zone = %zone, "alert delivery failed: {e:#}");
            }
        }))
    }
}

fn compose(plot: &Plot, moisture: i64, eval: &Evaluation) -> (String, String) {
    let (label, advice) = match eval.status {
        Status::Dry => ("too dry", "Consider watering this zone."),
        Status::Oversaturated => (
            "oversaturated",
            "Hold off watering and check drainage.",
        ),
        Status::Optimal => ("optimal", "No action needed."),
    };

    let subject = format!("Irrigation alert: {} is {label}", plot.name);
    let body = format!(
        "{name} ({crop}) reported {moisture}% moisture against an ideal of {ideal}% \
         (score {score}%).\n\n{advice}",
        name = plot.name,
        crop = plot.crop_type,
        ideal = plot.ideal_moisture,
        score = eval.score,
    );
    (subject, body)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irrigation::evaluate;
    use anyhow::anyhow;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl AlertDispatcher for RecordingDispatcher {
        async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((recipient.into(), subject.into(), body.into()));
            Ok(())
        }
    }

    struct FailingDispatcher;

    #[async_trait]
    impl AlertDispatcher for FailingDispatcher {
        async fn send(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Err(anyhow!("smtp unreachable"))
        }
    }

    struct BrokenGate;

    #[async_trait]
    impl CooldownGate for BrokenGate {
        async fn try_claim(&self, _: &str, _: i64) -> Result<bool> {
            Err(anyhow!("db locked"))
        }
    }

    fn plot() -> Plot {
        Plot {
            plot_id: "03256848-ddcf-4e66-b122-30a4a0af27ac".into(),
            name: "Zone 2".into(),
            crop_type: "Lettuce".into(),
            ideal_moisture: 70,
        }
    }

    async fn seeded_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_plot(&plot()).await.unwrap();
        db
    }

    fn alerter(db: &Db, dispatcher: Arc<dyn AlertDispatcher>) -> Alerter {
        Alerter::new(
            Some("grower@example.com".into()),
            Arc::new(DbCooldown::new(db.clone(), 30)),
            dispatcher,
        )
    }

    async fn finish(outcome: AlertOutcome) {
        match outcome {
            AlertOutcome::Dispatched(handle) => handle.await.unwrap(),
            AlertOutcome::Skipped(reason) => panic!("expected dispatch, skipped: {reason:?}"),
        }
    }

    #[tokio::test]
    async fn dry_reading_sends_alert() {
        let db = seeded_db().await;
        let rec = Arc::new(RecordingDispatcher::default());
        let a = alerter(&db, rec.clone());

        finish(a.maybe_alert(&plot(), 20, &evaluate(20, 70), 10_000).await).await;

        let sent = rec.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "grower@example.com");
        assert!(sent[0].1.contains("Zone 2 is too dry"), "subject: {}", sent[0].1);
        assert!(sent[0].2.contains("20% moisture"), "body: {}", sent[0].2);
    }

    #[tokio::test]
    async fn optimal_reading_is_skipped() {
        let db = seeded_db().await;
        let a = alerter(&db, Arc::new(RecordingDispatcher::default()));
        let out = a.maybe_alert(&plot(), 70, &evaluate(70, 70), 10_000).await;
        assert!(matches!(out, AlertOutcome::Skipped(SkipReason::Optimal)));
    }

    #[tokio::test]
    async fn no_recipient_disables_alerts() {
        let db = seeded_db().await;
        let a = Alerter::new(
            None,
            Arc::new(DbCooldown::new(db.clone(), 30)),
            Arc::new(LogDispatcher),
        );
        assert!(!a.enabled());
        let out = a.maybe_alert(&plot(), 5, &evaluate(5, 70), 10_000).await;
        assert!(matches!(out, AlertOutcome::Skipped(SkipReason::NoRecipient)));
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_alerts() {
        let db = seeded_db().await;
        let rec = Arc::new(RecordingDispatcher::default());
        let a = alerter(&db, rec.clone());
        let eval = evaluate(100, 70);

        finish(a.maybe_alert(&plot(), 100, &eval, 10_000).await).await;

        // 29 minutes later: still cooling down.
        let out = a.maybe_alert(&plot(), 100, &eval, 10_000 + 29 * 60).await;
        assert!(matches!(out, AlertOutcome::Skipped(SkipReason::CoolingDown)));

        // 30 minutes later: allowed again.
        finish(a.maybe_alert(&plot(), 100, &eval, 10_000 + 30 * 60).await).await;

        assert_eq!(rec.sent.lock().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bad_readings_send_one_alert() {
        let db = seeded_db().await;
        let rec = Arc::new(RecordingDispatcher::default());
        let a = Arc::new(alerter(&db, rec.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let a = Arc::clone(&a);
                tokio::spawn(async move {
                    a.maybe_alert(&plot(), 5, &evaluate(5, 70), 10_000).await
                })
            })
            .collect();

        let mut dispatched = 0;
        for t in tasks {
            match t.await.unwrap() {
                AlertOutcome::Dispatched(handle) => {
                    handle.await.unwrap();
                    dispatched += 1;
                }
                AlertOutcome::Skipped(reason) => assert_eq!(reason, SkipReason::CoolingDown),
            }
        }

        assert_eq!(dispatched, 1);
        assert_eq!(rec.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_still_consumes_cooldown() {
        let db = seeded_db().await;
        let a = alerter(&db, Arc::new(FailingDispatcher));
        finish(a.maybe_alert(&plot(), 5, &evaluate(5, 70), 10_000).await).await;

        let out = a.maybe_alert(&plot(), 5, &evaluate(5, 70), 10_060).await;
        assert!(matches!(out, AlertOutcome::Skipped(SkipReason::CoolingDown)));
    }

    #[tokio::test]
    async fn failed_delivery_is_contained() {
        let db = seeded_db().await;
        let a = alerter(&db, Arc::new(FailingDispatcher));
        // The spawned task logs the failure and completes normally.
        finish(a.maybe_alert(&plot(), 5, &evaluate(5, 70), 10_000).await).await;
    }

    #[tokio::test]
    async fn gate_failure_skips_alert() {
        let rec = Arc::new(RecordingDispatcher::default());
        let a = Alerter::new(
            Some("grower@example.com".into()),
            Arc::new(BrokenGate),
            rec.clone(),
        );
        let out = a.maybe_alert(&plot(), 5, &evaluate(5, 70), 10_000).await;
        assert!(matches!(out, AlertOutcome::Skipped(SkipReason::GateFailed)));
        assert!(rec.sent.lock().await.is_empty());
    }

    #[test]
    fn oversaturated_message() {
        let (subject, body) = compose(&plot(), 95, &evaluate(95, 70));
        assert_eq!(subject, "Irrigation alert: Zone 2 is oversaturated");
        assert!(body.contains("score 135%"), "body: {body}");
        assert!(body.contains("check drainage"));
    }
}
