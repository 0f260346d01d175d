//! Job orchestration: configuration, pacing, job entry points and the cron scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mf_core::{OutputRow, ProviderTag, SourceRow};
use mf_providers::{provider_for, Provider, ProviderError};
use mf_storage::{Database, HttpClientConfig, HttpFetcher, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod jobs;

pub use jobs::{OutputIngestionJob, SourceRefreshJob};

pub const DEFAULT_USER_AGENT: &str = mf_providers::DESKTOP_USER_AGENT;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub pacing: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sources_cron: String,
    pub outputs_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_path: var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/app.db")),
            pacing: Duration::from_millis(
                var("MF_PACING_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            ),
            http_timeout_secs: var("MF_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            user_agent: var("MF_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            scheduler_enabled: var("MF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sources_cron: var("SYNC_SOURCES_CRON").unwrap_or_else(|| "0 0 3 * * *".to_string()),
            outputs_cron: var("SYNC_OUTPUTS_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
        }
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Failure class for logs: `fetch_failure`, `schema_violation` or `storage_failure`.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Provider(err) => err.kind().as_str(),
            SyncError::Storage(_) => "storage_failure",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            SyncError::Provider(err) => err.retryable(),
            SyncError::Storage(_) => false,
        }
    }
}

/// Fixed wait between consecutive sources of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    interval: Duration,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait out the interval. Returns `false` if `cancel` fired first.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        if self.interval.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub provider: ProviderTag,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Output rows written; always 0 for source refresh.
    pub items: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn start(provider: ProviderTag, sources: usize) -> Self {
        let now = Utc::now();
        Self {
            provider,
            started_at: now,
            finished_at: now,
            sources,
            processed: 0,
            succeeded: 0,
            failed: 0,
            items: 0,
            cancelled: false,
        }
    }
}

pub async fn open_database(config: &SyncConfig) -> Result<Database> {
    let mut db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    db.migrate().await.context("creating tables")?;
    Ok(db)
}

fn build_provider(config: &SyncConfig, tag: ProviderTag, cancel: &CancellationToken) -> Result<Box<dyn Provider>> {
    let http = HttpFetcher::new(config.http_client_config(), cancel.clone())?;
    Ok(provider_for(tag, Arc::new(http)))
}

pub async fn run_source_refresh(config: &SyncConfig, tag: ProviderTag, cancel: CancellationToken) -> Result<RunSummary> {
    let provider = build_provider(config, tag, &cancel)?;
    let mut db = open_database(config).await?;
    let summary = SourceRefreshJob::new(&mut db, provider.as_ref(), Pacer::new(config.pacing))
        .run(&cancel)
        .await
        .with_context(|| format!("refreshing {tag} sources"))?;
    db.close().await.context("closing database")?;
    Ok(summary)
}

pub async fn run_output_ingestion(config: &SyncConfig, tag: ProviderTag, cancel: CancellationToken) -> Result<RunSummary> {
    let provider = build_provider(config, tag, &cancel)?;
    let mut db = open_database(config).await?;
    let summary = OutputIngestionJob::new(&mut db, provider.as_ref(), Pacer::new(config.pacing))
        .run(&cancel)
        .await
        .with_context(|| format!("ingesting {tag} outputs"))?;
    db.close().await.context("closing database")?;
    Ok(summary)
}

/// Resolve `term` with the provider and store the resulting source. `None` when nothing matched.
pub async fn add_source(
    config: &SyncConfig,
    tag: ProviderTag,
    term: &str,
    cancel: CancellationToken,
) -> Result<Option<SourceRow>> {
    let provider = build_provider(config, tag, &cancel)?;
    let Some(source) = provider
        .resolve(term)
        .await
        .with_context(|| format!("resolving `{term}` with {tag}"))?
    else {
        return Ok(None);
    };
    let row = provider.to_persisted_source(&source)?;

    let mut db = open_database(config).await?;
    db.upsert_source(&row).await?;
    db.close().await?;
    Ok(Some(row))
}

pub async fn list_sources(config: &SyncConfig, tag: ProviderTag) -> Result<Vec<SourceRow>> {
    let mut db = open_database(config).await?;
    let rows = db.sources_for(tag).await?;
    db.close().await?;
    Ok(rows)
}

/// One page of a provider's outputs, newest release first.
pub async fn list_outputs(config: &SyncConfig, tag: ProviderTag, limit: u32, page: u32) -> Result<Vec<OutputRow>> {
    let provider = build_provider(config, tag, &CancellationToken::new())?;
    let mut db = open_database(config).await?;
    let rows = db
        .outputs_for(tag, provider.release_date_path(), limit, page)
        .await?;
    db.close().await?;
    Ok(rows)
}

/// Cron scheduler running both jobs for every provider, or `None` when disabled.
pub async fn maybe_build_scheduler(config: &SyncConfig, cancel: CancellationToken) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let refresh_config = config.clone();
    let refresh_cancel = cancel.clone();
    let refresh = Job::new_async(config.sources_cron.as_str(), move |_uuid, _l| {
        let config = refresh_config.clone();
        let cancel = refresh_cancel.clone();
        Box::pin(async move {
            for tag in ProviderTag::ALL {
                match run_source_refresh(&config, tag, cancel.clone()).await {
                    Ok(summary) => info!(provider = %tag, failed = summary.failed, "scheduled source refresh done"),
                    Err(err) => error!(provider = %tag, error = %format!("{err:#}"), "scheduled source refresh failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sources_cron))?;
    sched.add(refresh).await.context("adding source refresh job")?;

    let ingest_config = config.clone();
    let ingest_cancel = cancel;
    let ingest = Job::new_async(config.outputs_cron.as_str(), move |_uuid, _l| {
        let config = ingest_config.clone();
        let cancel = ingest_cancel.clone();
        Box::pin(async move {
            for tag in ProviderTag::ALL {
                match run_output_ingestion(&config, tag, cancel.clone()).await {
                    Ok(summary) => info!(provider = %tag, items = summary.items, "scheduled output ingestion done"),
                    Err(err) => error!(provider = %tag, error = %format!("{err:#}"), "scheduled output ingestion failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.outputs_cron))?;
    sched.add(ingest).await.context("adding output ingestion job")?;

    Ok(Some(sched))
}
