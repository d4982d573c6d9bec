use std::sync::Arc;

use anyhow::{bail, Context, Result};
use beacon_core::ConversationId;
use beacon_storage::{LedgerStore, SqlLedgerStore};
use beacon_sync::{DispatchOutcome, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "beacon-cli")]
#[command(about = "Sync beacon widget profile notes into helpdesk custom fields")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass.
    Sync {
        /// Raw search query string, appended verbatim to the search URL.
        #[arg(long)]
        query: Option<String>,
    },
    /// Run sync passes on the configured cron schedule until ctrl-c.
    Schedule,
    /// Print the update body a sync would send for one conversation.
    Preview { conversation_id: String },
    /// Drop a conversation from the ledger so the next sync picks it up again.
    Forget { conversation_id: String },
    /// List ledger entries.
    Ledger,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { query: None }) {
        Commands::Sync { query } => {
            let summary = beacon_sync::run_sync_once_from_env(query).await?;
            println!(
                "sync complete: run_id={} matched={} skipped={} unavailable={} sent={} failed={}",
                summary.run_id,
                summary.matched,
                summary.skipped,
                summary.unavailable,
                summary.sent,
                summary.failed
            );
            for report in &summary.reports {
                if let DispatchOutcome::Failed { reason } = &report.outcome {
                    println!("  failed {}: {}", report.conversation_id, reason);
                }
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::connect(SyncConfig::from_env()).await?);
            let cron = pipeline.config().sync_cron.clone();
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set BEACON_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Preview { conversation_id } => {
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
            match pipeline.preview(&ConversationId::new(conversation_id.clone())).await? {
                Some(payload) => println!("{payload}"),
                None => println!("conversation {conversation_id} has no beacon customer information"),
            }
        }
        Commands::Forget { conversation_id } => {
            let ledger = SqlLedgerStore::connect(&SyncConfig::from_env().ledger_database_url).await?;
            if ledger.remove(&ConversationId::new(conversation_id.clone())).await? {
                println!("removed {conversation_id} from ledger");
            } else {
                println!("{conversation_id} was not in the ledger");
            }
        }
        Commands::Ledger => {
            let ledger = SqlLedgerStore::connect(&SyncConfig::from_env().ledger_database_url).await?;
            for entry in ledger.entries().await? {
                println!(
                    "{}\t{}\t{}",
                    entry.conversation_id,
                    entry.updated_on.to_rfc3339(),
                    entry.payload_sent
                );
            }
        }
    }

    Ok(())
}
