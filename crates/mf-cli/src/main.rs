use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mf_core::ProviderTag;
use mf_sync::{RunSummary, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "mf-cli")]
#[command(about = "Media follower command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Re-fetch tracked sources and overwrite their snapshots.
    SyncSources {
        /// Limit the run to one provider; all providers otherwise.
        #[arg(long)]
        provider: Option<ProviderTag>,
    },
    /// Fetch release items for every tracked source and merge them into storage.
    SyncOutputs {
        #[arg(long)]
        provider: Option<ProviderTag>,
    },
    /// Resolve a search term and start tracking the result.
    AddSource {
        #[arg(long)]
        provider: ProviderTag,
        #[arg(long)]
        term: String,
    },
    ListSources {
        #[arg(long)]
        provider: ProviderTag,
    },
    ListOutputs {
        #[arg(long)]
        provider: ProviderTag,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        page: u32,
    },
    Migrate,
    /// Run both jobs on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match cli.command.unwrap_or(Commands::SyncOutputs { provider: None }) {
        Commands::SyncSources { provider } => {
            for tag in selected(provider) {
                if cancel.is_cancelled() {
                    break;
                }
                let summary = mf_sync::run_source_refresh(&config, tag, cancel.clone()).await?;
                print_summary("source refresh", &summary);
            }
        }
        Commands::SyncOutputs { provider } => {
            for tag in selected(provider) {
                if cancel.is_cancelled() {
                    break;
                }
                let summary = mf_sync::run_output_ingestion(&config, tag, cancel.clone()).await?;
                print_summary("output ingestion", &summary);
            }
        }
        Commands::AddSource { provider, term } => {
            match mf_sync::add_source(&config, provider, &term, cancel).await? {
                Some(row) => println!("tracking {}", row.key()),
                None => println!("no {provider} match for `{term}`"),
            }
        }
        Commands::ListSources { provider } => {
            for row in mf_sync::list_sources(&config, provider).await? {
                println!("{}\t{}", row.key(), row.raw);
            }
        }
        Commands::ListOutputs { provider, limit, page } => {
            for row in mf_sync::list_outputs(&config, provider, limit, page).await? {
                println!("{}\t{}\t{}", row.input_id, row.id, row.raw);
            }
        }
        Commands::Migrate => {
            let db = mf_sync::open_database(&config).await?;
            db.close().await.context("closing database")?;
            println!("schema ready at {}", config.database_path.display());
        }
        Commands::Schedule => {
            let Some(mut sched) = mf_sync::maybe_build_scheduler(&config, cancel.clone()).await? else {
                warn!("scheduler disabled; set MF_SCHEDULER_ENABLED=true to run it");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                sources_cron = %config.sources_cron,
                outputs_cron = %config.outputs_cron,
                "scheduler running"
            );
            cancel.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn selected(provider: Option<ProviderTag>) -> Vec<ProviderTag> {
    provider.map_or_else(|| ProviderTag::ALL.to_vec(), |tag| vec![tag])
}

fn print_summary(job: &str, summary: &RunSummary) {
    println!(
        "{job} complete: provider={} sources={} processed={} succeeded={} failed={} items={} cancelled={}",
        summary.provider,
        summary.sources,
        summary.processed,
        summary.succeeded,
        summary.failed,
        summary.items,
        summary.cancelled
    );
}

/// Cancel on Ctrl-C, and on SIGTERM where the platform has it.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "sigterm handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested; finishing the current source");
    cancel.cancel();
}
