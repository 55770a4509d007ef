pub mod cli;

use clap::Parser;
use serde::Serialize;
use tracing::Instrument;

use allocator::config::AppConfig;
use allocator::logger::{TraceId, annotate_participant, init_tracing, root_span};
use cli::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = resolve_config(&cli)?;

    init_tracing(cfg.json_logs)?;

    let span = root_span("allocator", &TraceId::generate());
    run(cli, cfg).instrument(span).await
}

async fn run(cli: Cli, cfg: AppConfig) -> anyhow::Result<()> {
    let engine = build_engine(&cfg).await?;

    match cli.command {
        Command::Init { blob_dir, blob_url } => {
            let blobs = blob_store_for(blob_dir, blob_url, &cfg)?;
            let report = engine.initialize(blobs.as_deref()).await?;
            print_json(&report)
        }

        Command::Assign { participant } => {
            annotate_participant(&participant);
            match engine.assign(&participant).await {
                Ok(a) => print_json(&a),
                Err(e) => {
                    tracing::error!(error = %e, "assignment not possible");
                    eprintln!("{}", e.user_message());
                    Err(e.into())
                }
            }
        }

        Command::Capacity => print_json(&engine.capacity().await?),

        Command::Stats => print_json(&engine.statistics().await?),

        Command::Reset { yes } => {
            if !yes {
                anyhow::bail!("refusing to reset without --yes");
            }
            let version = engine.reset_all_counts().await?;
            print_json(&serde_json::json!({ "reset": true, "ledger_version": version }))
        }

        Command::Logs { limit } => print_json(&engine.recent_logs(limit).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
