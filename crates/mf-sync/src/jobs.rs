//! The two recurring jobs: source refresh and output ingestion.
//!
//! Both walk every source of one provider in storage order, stop before the
//! next source once the cancellation token fires, isolate per-source failures
//! and finish with a WAL checkpoint.

use chrono::Utc;
use mf_core::{OutputRow, SourceRow};
use mf_providers::{Provider, ProviderError};
use mf_storage::Database;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{Pacer, RunSummary, SyncError};

/// Re-fetches every source of a provider and overwrites its stored snapshot.
pub struct SourceRefreshJob<'a> {
    db: &'a mut Database,
    provider: &'a dyn Provider,
    pacer: Pacer,
}

impl<'a> SourceRefreshJob<'a> {
    pub fn new(db: &'a mut Database, provider: &'a dyn Provider, pacer: Pacer) -> Self {
        Self { db, provider, pacer }
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunSummary, SyncError> {
        let span = info_span!("source_refresh", provider = %self.provider.tag());
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<RunSummary, SyncError> {
        let tag = self.provider.tag();
        let sources = self.db.sources_for(tag).await?;
        let mut summary = RunSummary::start(tag, sources.len());
        info!(sources = sources.len(), "source refresh started");

        for (index, row) in sources.iter().enumerate() {
            if !proceed(index, &self.pacer, cancel).await {
                summary.cancelled = true;
                info!(remaining = sources.len() - index, "source refresh cancelled");
                break;
            }

            summary.processed += 1;
            match self.refresh_one(row).await {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => {
                    summary.failed += 1;
                    warn!(source = %row.key(), "source vanished from storage during refresh");
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(
                        source = %row.key(),
                        kind = err.kind(),
                        retryable = err.retryable(),
                        error = %err,
                        "source refresh failed"
                    );
                }
            }
        }

        checkpoint(self.db).await;
        summary.finished_at = Utc::now();
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "source refresh finished"
        );
        Ok(summary)
    }

    async fn refresh_one(&mut self, row: &SourceRow) -> Result<bool, SyncError> {
        let source = self.provider.refresh(row).await?;
        let fresh = self.provider.to_persisted_source(&source)?;
        let updated = SourceRow {
            id: row.id.clone(),
            provider: row.provider,
            raw: fresh.raw,
        };
        Ok(self.db.update_source_raw(&updated).await?)
    }
}

/// Fetches release items for every source of a provider and upserts them.
pub struct OutputIngestionJob<'a> {
    db: &'a mut Database,
    provider: &'a dyn Provider,
    pacer: Pacer,
}

impl<'a> OutputIngestionJob<'a> {
    pub fn new(db: &'a mut Database, provider: &'a dyn Provider, pacer: Pacer) -> Self {
        Self { db, provider, pacer }
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunSummary, SyncError> {
        let span = info_span!("output_ingestion", provider = %self.provider.tag());
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<RunSummary, SyncError> {
        let tag = self.provider.tag();
        let sources = self.db.sources_for(tag).await?;
        let mut summary = RunSummary::start(tag, sources.len());
        info!(sources = sources.len(), "output ingestion started");

        for (index, row) in sources.iter().enumerate() {
            if !proceed(index, &self.pacer, cancel).await {
                summary.cancelled = true;
                info!(remaining = sources.len() - index, "output ingestion cancelled");
                break;
            }

            summary.processed += 1;
            match self.ingest_one(row).await {
                Ok(synced) => {
                    summary.succeeded += 1;
                    summary.items += synced;
                    info!(source = %row.key(), synced, "outputs synced");
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(
                        source = %row.key(),
                        kind = err.kind(),
                        retryable = err.retryable(),
                        error = %err,
                        "output ingestion failed"
                    );
                }
            }
        }

        checkpoint(self.db).await;
        summary.finished_at = Utc::now();
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            items = summary.items,
            "output ingestion finished"
        );
        Ok(summary)
    }

    /// All items of one source are written in a single transaction.
    async fn ingest_one(&mut self, row: &SourceRow) -> Result<usize, SyncError> {
        let source = self.provider.from_persisted_source(row)?;
        let items = self.provider.fetch_items(&source).await?;
        if items.is_empty() {
            return Ok(0);
        }

        let rows = items
            .iter()
            .map(|item| {
                Ok((
                    self.provider.to_persisted_output(row, item)?,
                    self.provider.to_persisted_patch(row, item)?,
                ))
            })
            .collect::<Result<Vec<(OutputRow, OutputRow)>, ProviderError>>()?;
        let mut tx = self.db.begin().await?;
        for (full, patch) in &rows {
            if let Err(err) = tx.upsert_output(full, patch).await {
                tx.rollback().await;
                return Err(err.into());
            }
        }
        tx.commit().await?;
        Ok(rows.len())
    }
}

/// Whether to start the source at `index`: never after cancellation, and only
/// after the pacing wait when it is not the first one.
async fn proceed(index: usize, pacer: &Pacer, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if index == 0 {
        return true;
    }
    pacer.pause(cancel).await
}

async fn checkpoint(db: &mut Database) {
    if let Err(err) = db.checkpoint().await {
        warn!(error = %err, "wal checkpoint failed");
    }
}
