use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::alerts::Alerter;
use crate::auth::ApiKeys;
use crate::db::Db;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<AppState>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct AppState {
    pub db: Db,
    pub api_keys: ApiKeys,
    pub alerter: Alerter,
    pub activity: RwLock<ActivityLog>,
}

impl AppState {
    pub fn new(db: Db, api_keys: ApiKeys, alerter: Alerter) -> SharedState {
        Arc::new(Self {
            db,
            api_keys,
            alerter,
            activity: RwLock::new(ActivityLog::new()),
        })
    }
}

pub struct ActivityLog {
    pub started_at: Instant,
    pub readings_accepted: u64,
    pub plots_provisioned: u64,
    pub alerts_dispatched: u64,
    pub events: VecDeque<ActivityEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub readings_accepted: u64,
    pub plots_provisioned: u64,
    pub alerts_dispatched: u64,
    pub alerts_enabled: bool,
    pub events: Vec<ActivityEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            readings_accepted: 0,
            plots_provisioned: 0,
            alerts_dispatched: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record an accepted reading.
    pub fn record_reading(&mut self, detail: String) {
        self.readings_accepted += 1;
        self.push_event(EventKind::Reading, detail);
    }

    /// Record a plot created on first contact.
    pub fn record_provisioned(&mut self, plot_id: &str) {
        self.plots_provisioned += 1;
        self.push_event(
            EventKind::System,
            format!("auto-provisioned plot {plot_id}"),
        );
    }

    /// Record an alert handed to the dispatcher.
    pub fn record_alert(&mut self, detail: String) {
        self.alerts_dispatched += 1;
        self.push_event(EventKind::Alert, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self, alerts_enabled: bool) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            readings_accepted: self.readings_accepted,
            plots_provisioned: self.plots_provisioned,
            alerts_dispatched: self.alerts_dispatched,
            alerts_enabled,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(ActivityEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
