mod alerts;
mod auth;
mod config;
mod db;
mod ingest;
mod irrigation;
mod state;
mod stats;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alerts::{Alerter, DbCooldown, LogDispatcher};
use auth::ApiKeys;
use db::Db;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file (server, alerts, keys, seed plots) ──────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let addr = cfg.bind_addr()?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url)
        .await
        .with_context(|| format!("failed to open database {}", cfg.database.url))?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;

    let plots = db.load_plots().await?;
    info!(plots = plots.len(), "db ready");
    if plots.is_empty() {
        warn!("no plots configured; sensors will be auto-provisioned on first reading");
    }

    // ── Ingestion keys ──────────────────────────────────────────────
    let api_keys = ApiKeys::from_config(&cfg.api_keys);
    if api_keys.is_open() {
        warn!("no api keys configured; reading ingestion is unauthenticated");
    } else {
        info!(keys = api_keys.len(), "api key table loaded");
    }

    // ── Alerts ──────────────────────────────────────────────────────
    let alerter = Alerter::new(
        cfg.alerts.recipient.clone(),
        Arc::new(DbCooldown::new(db.clone(), cfg.alerts.cooldown_min)),
        Arc::new(LogDispatcher),
    );
    if !alerter.enabled() {
        warn!("no alert recipient configured; alerts are disabled");
    }

    // ── Shared state + web server ───────────────────────────────────
    let state = AppState::new(db, api_keys, alerter);
    state
        .activity
        .write()
        .await
        .record_system("hub started".to_string());

    web::serve(state, addr).await
}
