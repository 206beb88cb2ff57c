// =============================================================================
// Tidemark — Main Entry Point
// =============================================================================
//
// Demo replay: a deterministic synthetic bar feed runs through the full
// pipeline for one symbol, then the metrics snapshot and the SHA-256 of the
// ordered event log are printed. Running the binary twice must print the
// same digest; that is the replay-determinism contract in miniature.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod candidate;
mod config;
mod detectors;
mod errors;
mod events;
mod indicators;
mod metrics;
mod overlap;
mod pipeline;
mod registry;
mod ring_buffer;
mod risk;
mod timeframe;
mod types;
mod wheel;
mod zone_watcher;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::events::{event_log_digest, MemoryEventSink, MemoryIntentSink, OrderOutcome};
use crate::pipeline::Pipeline;
use crate::timeframe::Timeframe;
use crate::types::Bar;

/// Deterministic xorshift64* synthetic walk; the same seed yields the same
/// bars on every platform.
fn synthetic_bars(symbol: &str, start: DateTime<Utc>, count: usize) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(count);
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut price = 50_000.0;
    for i in 0..count {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let uniform =
            (state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40) as f64 / (1u64 << 24) as f64;
        let drift = (uniform - 0.5) * 30.0;

        let open = price;
        price += drift;
        let close = price;
        let high = open.max(close) + drift.abs() * 0.4 + 0.5;
        let low = open.min(close) - drift.abs() * 0.4 - 0.5;
        let volume = 800.0 + ((state >> 20) % 600) as f64;

        bars.push(Bar {
            ts: start + Duration::minutes(i as i64),
            open,
            high,
            low,
            close,
            volume,
            symbol: symbol.to_string(),
            timeframe: Timeframe::M1,
        });
    }
    bars
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Tidemark liquidity pipeline — replay demo starting");

    let config = match std::env::var("TIDEMARK_CONFIG") {
        Ok(path) => PipelineConfig::load(&path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            PipelineConfig::default()
        }),
        Err(_) => PipelineConfig::default(),
    };

    let symbol = std::env::var("TIDEMARK_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string());
    let bar_count: usize = std::env::var("TIDEMARK_BARS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(50_000);

    let mut pipeline = Pipeline::new(&config)?;
    let metrics = pipeline.metrics();

    // The bar source is an external collaborator; the driver just pulls one
    // bar at a time and runs it to completion.
    let (tx, mut rx) = mpsc::channel::<Bar>(1024);
    let feed_symbol = symbol.clone();
    let producer = tokio::spawn(async move {
        let start: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().expect("valid start");
        for bar in synthetic_bars(&feed_symbol, start, bar_count) {
            if tx.send(bar).await.is_err() {
                break;
            }
        }
    });

    let mut events = MemoryEventSink::default();
    let mut orders = MemoryIntentSink::default();
    while let Some(bar) = rx.recv().await {
        if let Err(e) = pipeline.feed(&bar, &mut events, &mut orders) {
            warn!(symbol = %symbol, error = %e, "pipeline halted");
            break;
        }
    }
    producer.await?;

    let intents = orders
        .outcomes
        .iter()
        .filter(|o| matches!(o, OrderOutcome::Intent(_)))
        .count();
    let rejected = orders.outcomes.len() - intents;

    for tf in &config.aggregation.target_timeframes {
        if let Some(last) = pipeline.recent_closed(*tf).last() {
            info!(tf = %tf, ts = %last.ts, close = last.close, "last closed bar");
        }
    }

    info!(
        symbol = %symbol,
        bars = bar_count,
        events = events.events.len(),
        intents,
        rejected,
        "replay complete"
    );

    let snapshot = metrics.snapshot();
    println!("metrics: {}", serde_json::to_string_pretty(&snapshot)?);
    println!("event-log sha256: {}", event_log_digest(&events.events));

    Ok(())
}
