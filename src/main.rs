use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

mod config;
mod promql;
mod proxy;
mod telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "tenantproxy",
    about = "A tenant-isolating proxy for Prometheus and Alertmanager"
)]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: PathBuf,

    /// Output logs as JSON (default: human-readable)
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = config::load(&args.config)?;
    telemetry::init_tracing("info", args.json);

    info!(listen = %config.proxy.listen, "starting tenantproxy");

    proxy::run(config).await
}
