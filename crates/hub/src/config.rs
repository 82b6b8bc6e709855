//! TOML config file loading, validation, and database seeding for plots.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//!
//! [database]
//! url = "sqlite:orchard.db?mode=rwc"
//!
//! [alerts]
//! recipient = "grower@example.com"
//! cooldown_min = 60
//!
//! [[api_keys]]
//! key = "arduino-zone1-key-abc123"
//! plot_id = "950b5dd5-c2e6-4aeb-b2d0-8cf5b89c033e"
//!
//! [[plots]]
//! plot_id = "950b5dd5-c2e6-4aeb-b2d0-8cf5b89c033e"
//! name = "Zone 1"
//! crop_type = "Tomatoes"
//! ideal_moisture = 60
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use uuid::Uuid;

use crate::db::{Db, Plot};

/// Shortest API key accepted.
const MIN_API_KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub alerts: AlertConfig,
    pub api_keys: Vec<ApiKeyEntry>,
    pub plots: Vec<PlotEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:orchard.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Where alert emails go. Alerts are disabled when unset.
    pub recipient: Option<String>,
    /// Minimum minutes between two alerts for the same plot.
    pub cooldown_min: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            cooldown_min: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    /// Restrict the key to one plot. Unbound keys may post for any plot.
    pub plot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlotEntry {
    pub plot_id: String,
    pub name: String,
    pub crop_type: String,
    pub ideal_moisture: i64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_server(&mut errors);
        self.validate_alerts(&mut errors);
        self.validate_api_keys(&mut errors);
        self.validate_plots(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Bind address, already checked by `validate`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.server.bind))
    }

    fn validate_server(&self, errors: &mut Vec<String>) {
        if self.server.bind.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind '{}' is not a host:port address",
                self.server.bind
            ));
        }
        if self.database.url.trim().is_empty() {
            errors.push("database.url is empty".to_string());
        }
    }

    fn validate_alerts(&self, errors: &mut Vec<String>) {
        if let Some(to) = &self.alerts.recipient {
            if !to.contains('@') || to.trim() != to {
                errors.push(format!("alerts.recipient '{to}' is not an email address"));
            }
        }
        if self.alerts.cooldown_min <= 0 {
            errors.push(format!(
                "alerts.cooldown_min must be positive, got {}",
                self.alerts.cooldown_min
            ));
        }
    }

    fn validate_api_keys(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, k) in self.api_keys.iter().enumerate() {
            let ctx = format!("api_keys[{i}]");

            if k.key.len() < MIN_API_KEY_LEN {
                errors.push(format!(
                    "{ctx}: key must be at least {MIN_API_KEY_LEN} characters"
                ));
            } else if !seen.insert(&k.key) {
                errors.push(format!("{ctx}: duplicate key"));
            }

            if let Some(plot_id) = &k.plot_id {
                if Uuid::parse_str(plot_id).is_err() {
                    errors.push(format!("{ctx}: plot_id '{plot_id}' is not a UUID"));
                }
            }
        }
    }

    fn validate_plots(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<String> = HashSet::new();

        for (i, p) in self.plots.iter().enumerate() {
            let ctx = || {
                if p.plot_id.is_empty() {
                    format!("plots[{i}]")
                } else {
                    format!("plot '{}'", p.plot_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if Uuid::parse_str(&p.plot_id).is_err() {
                errors.push(format!("{}: plot_id is not a UUID", ctx()));
            } else if !seen_ids.insert(normalize_plot_id(&p.plot_id)) {
                errors.push(format!("{}: duplicate plot_id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if p.crop_type.trim().is_empty() {
                errors.push(format!("{}: crop_type is empty", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults. `DB_URL` and `BIND_ADDR` override the file.
pub fn load(path: &str) -> Result<Config> {
    let mut config: Config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };
    if let Ok(url) = env::var("DB_URL") {
        config.database.url = url;
    }
    if let Ok(bind) = env::var("BIND_ADDR") {
        config.server.bind = bind;
    }
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all seed plots from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for p in &config.plots {
        db.upsert_plot(&Plot {
            plot_id: normalize_plot_id(&p.plot_id),
            name: p.name.clone(),
            crop_type: p.crop_type.clone(),
            ideal_moisture: p.ideal_moisture,
        })
        .await
        .with_context(|| format!("failed to upsert plot '{}'", p.plot_id))?;
    }

    tracing::info!(plots = config.plots.len(), "config applied");

    Ok(())
}

/// Canonical (lowercase, hyphenated) form of a plot UUID. Non-UUID input is
/// returned unchanged.
pub fn normalize_plot_id(id: &str) -> String {
    Uuid::parse_str(id)
        .map(|u| u.hyphenated().to_string())
        .unwrap_or_else(|_| id.to_string())
}

// ===========================================================================
// Tests
// ===========================================================================
