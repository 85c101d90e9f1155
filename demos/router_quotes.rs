//! Quote load against a router service: two GET routes, one per swap direction.
//!
//! ```sh
//! BASE_URL=http://localhost:9092 cargo run --example router_quotes -- demos/router_quotes.yaml
//! ```
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use stampede::{Controller, EngineConfig, HttpGet, Stage, TaskSet};
use tracing_subscriber::EnvFilter;

const UOSMO: &str = "uosmo";
const USDC: &str = "ibc/498A0751C798A0D9A389AA3691123DADA57DAA4FE165D5C75894505B876BA6E4";

fn route(client: &Client, base_url: &str, token_out: &str, token_in: &str) -> HttpGet {
    HttpGet::builder()
        .client(client.clone())
        .base_url(base_url)
        .path("/router/routes")
        .query(vec![
            ("tokenOut".to_string(), token_out.to_string()),
            ("tokenInDenom".to_string(), token_in.to_string()),
        ])
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        None => EngineConfig::builder()
            .max_users(20)
            .ramp_rate(5.0)
            .stages(vec![
                Stage::new(Duration::from_secs(30), 20),
                Stage::new(Duration::from_secs(10), 0),
            ])
            .build(),
    };
    let base_url = std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:9092".into());

    // One client for every task so all users share its connection pool
    let client = Client::new();
    let tasks = TaskSet::builder()
        .task("routes_uosmo_usdc", route(&client, &base_url, UOSMO, USDC))
        .task("routes_usdc_uosmo", route(&client, &base_url, USDC, UOSMO))
        .build()?;

    let controller = Controller::new(config, tasks)?;
    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping...");
            stop.stop();
        }
    });

    let summary = controller.run().await?;
    for (name, tally) in &summary.snapshot.tasks {
        tracing::info!(
            "{name}: {} requests, {} errors, p95 {:?}",
            tally.count,
            tally.error_count(),
            tally.latency.percentile(95.0)
        );
    }
    Ok(())
}
