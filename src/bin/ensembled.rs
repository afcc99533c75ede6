//! `ensembled` – Ensemble runtime daemon serving the NDJSON control plane.

use clap::Parser;
use ensemble::runtime::service::Service;
use ensemble::runtime::{Runtime, RuntimeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ensembled", version, about = "Ensemble runtime daemon")]
struct Args {
    /// Root directory for runtime storage
    #[arg(long, default_value = ".ensemble")]
    root: PathBuf,

    /// Address for the control-plane listener
    #[arg(long, default_value = "127.0.0.1:7747")]
    listen: String,

    /// Object store memory capacity in bytes
    #[arg(long)]
    store_capacity_bytes: Option<usize>,

    /// Concurrently executing tasks
    #[arg(long)]
    worker_slots: Option<usize>,

    /// Disable spilling cold objects to disk
    #[arg(long)]
    no_spill: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = RuntimeConfig {
        root: args.root,
        ..RuntimeConfig::default()
    };
    if let Some(capacity) = args.store_capacity_bytes {
        config.store_capacity_bytes = capacity;
    }
    if let Some(slots) = args.worker_slots {
        config.worker_slots = slots;
    }
    if args.no_spill {
        config.spill_enabled = false;
    }

    Runtime::init(config.clone())?;
    let runtime = Arc::new(Runtime::new(config)?);
    let service = Service::new(runtime);

    let listener = TcpListener::bind(&args.listen).await?;
    service.serve(listener).await?;
    Ok(())
}
