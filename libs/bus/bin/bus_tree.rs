//! Bus tree demo - builds a two-level tree in process and runs an ask-all
//!
//! Usage:
//!   bus-tree
//!   bus-tree --config config/bus.toml --log-level debug
//!   bus-tree --json-logs --wait

use anyhow::Result;
use bus_core::{Bus, BusConfig, MemoryTransport, NodeOptions, ProcedureTable, Value};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bus-tree")]
#[command(about = "Hierarchical message bus demo")]
#[command(version)]
struct Args {
    /// Path to configuration file (applied to both buses)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Number of subscribers on the child bus
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Keep the tree running until Ctrl+C
    #[arg(long)]
    wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let base = BusConfig::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let root = Bus::new(BusConfig {
        name: format!("{}-root", base.name),
        ..base.clone()
    })?;
    let (up, down) = MemoryTransport::pair();
    let leaf = Bus::with_parent(
        BusConfig {
            name: format!("{}-leaf", base.name),
            ..base
        },
        up,
    )?;
    let leaf_id = root.bridge(down).await?;
    info!(child = %leaf_id, "Tree ready");

    for index in 0..args.workers {
        let worker = leaf.join(NodeOptions::new(format!("worker-{index}"))).await?;
        let table = ProcedureTable::new().with("square", move |args: Vec<Value>| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::object([
                ("worker", Value::from(index as i64)),
                ("result", Value::from(n * n)),
            ]))
        });
        worker.subscribe("jobs", table).await?;
    }

    let client = root.join(NodeOptions::new("client")).await?;
    let results = client
        .topic("jobs")
        .all("square", vec![Value::from(12)])?
        .collect_all()
        .await;

    for result in &results {
        match result {
            Ok(value) => match value.to_json() {
                Ok(json) => info!(result = %json, "Worker replied"),
                Err(e) => error!(error = %e, "Reply is not plain data"),
            },
            Err(e) => error!(error = %e, "Worker failed"),
        }
    }
    info!(replies = results.len(), "Ask-all complete");

    if args.wait {
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
    }

    leaf.shutdown();
    root.shutdown();
    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
