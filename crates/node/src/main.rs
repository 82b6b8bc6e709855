mod sim;

use anyhow::{Context, Result};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{PlotSim, Scenario};

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000/readings/";
const API_KEY_HEADER: &str = "x-api-key";

/// Mock zones posted to when `PLOT_IDS` is unset.
const DEFAULT_PLOT_IDS: [&str; 8] = [
    "03256848-ddcf-4e66-b122-30a4a0af27ac",
    "4084dce6-1537-45e7-a435-05479b6c5263",
    "f65f9eda-4f72-4273-bc83-014c6fc3a7d7",
    "27b29098-ce21-4b11-b7e5-69d21fe96c92",
    "ac02134e-594b-403f-a49d-164d04393b60",
    "a72aa36a-757b-4132-b710-9dafb93ff030",
    "b8a51a6b-e674-42c8-bdf6-029aa5e30c94",
    "e6e36356-163d-4d79-ad3b-9a195cd6d5b8",
];

#[derive(Debug, Serialize)]
struct ReadingMsg<'a> {
    plot_id: &'a str,
    moisture: i64,
    light: i64,
}

fn parse_plot_ids(raw: Option<String>) -> Vec<String> {
    match raw {
        Some(s) => s
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect(),
        None => DEFAULT_PLOT_IDS.iter().map(|s| s.to_string()).collect(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let backend_url = env::var("BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
    let api_key = env::var("API_KEY").ok();
    let plot_ids = parse_plot_ids(env::var("PLOT_IDS").ok());
    let interval_s: u64 = env::var("SLEEP_INTERVAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    if plot_ids.is_empty() {
        anyhow::bail!("PLOT_IDS is set but contains no plot ids");
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build http client")?;

    let mut sim = PlotSim::new(scenario, plot_ids.len());
    info!(
        url = %backend_url,
        plots = sim.plot_count(),
        %scenario,
        interval_s,
        "mock hardware started"
    );

    loop {
        for (i, plot_id) in plot_ids.iter().enumerate() {
            let sample = sim.sample(i);
            let msg = ReadingMsg {
                plot_id,
                moisture: sample.moisture,
                light: sample.light,
            };

            let mut req = client.post(&backend_url).json(&msg);
            if let Some(key) = &api_key {
                req = req.header(API_KEY_HEADER, key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(zone = %plot_id, moisture = msg.moisture, light = msg.light, "sent reading");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(zone = %plot_id, %status, body = %body, "backend rejected reading");
                }
                Err(e) => {
                    warn!(zone = %plot_id, "post failed: {e}. retrying next tick");
                }
            }
        }

        sleep(Duration::from_secs(interval_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
