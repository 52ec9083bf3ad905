//! Multi-lot breakout bot - Entry Point
//!
//! Recovers state from the journal, then drives the application from a
//! replay script (`--replay`) or from script lines on stdin.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use lotbot_bot::{replay, AppConfig, Application, BotEvent};
use lotbot_executor::{MockBroker, OrderMode};
use lotbot_persistence::JsonLinesStore;

/// Multi-lot breakout bot
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via LOTBOT_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Order mode override (virtual or real)
    #[arg(short, long)]
    mode: Option<OrderMode>,

    /// Event script to replay instead of reading stdin
    #[arg(short, long)]
    replay: Option<String>,

    /// Write the final Prometheus metrics to this file on stop
    #[arg(long)]
    metrics_out: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    lotbot_telemetry::init_logging()?;

    info!("Starting lotbot v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    info!(
        mode = %config.mode,
        data_dir = %config.persistence.data_dir,
        "Configuration loaded"
    );

    let snapshot = JsonLinesStore::replay(&config.persistence.data_dir)?;
    let store = Arc::new(JsonLinesStore::new(&config.persistence.data_dir)?);

    // No broker wire adapter ships with the binary; the offline gateway
    // accepts every order.
    let broker = Arc::new(MockBroker::new());

    let app = Application::new(config, broker, store);
    if !snapshot.is_empty() {
        app.recover(&snapshot)?;
    }
    app.start();

    let (tx, rx) = mpsc::channel::<BotEvent>(1000);
    let feeder = match args.replay {
        Some(path) => {
            let events = replay::read_script(&path)?;
            info!(path = %path, events = events.len(), "Replaying script");
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(BotEvent::Shutdown).await;
            })
        }
        None => tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut line_no = 0usize;
            while let Ok(Some(line)) = lines.next_line().await {
                line_no += 1;
                match replay::parse_line(&line, line_no) {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping input line"),
                }
            }
        }),
    };

    let report = app.run(rx).await?;
    feeder.abort();

    info!(
        applied = report.stats.applied,
        failed = report.stats.failed,
        evicted = report.stats.evicted,
        discarded = report.discarded,
        "Stopped"
    );
    if let Some(path) = args.metrics_out {
        std::fs::write(&path, lotbot_telemetry::Metrics::gather_text()?)?;
        info!(path = %path, "Metrics written");
    }
    Ok(())
}
