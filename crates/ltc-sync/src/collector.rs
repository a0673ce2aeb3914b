//! Sequential, resumable collection of one source's detail pages.
//!
//! The collector walks the enumerated homes in order, one at a time. Progress
//! is checkpointed every `checkpoint_every` processed homes and once more on
//! completion. Resume is positional: a checkpoint holding `k` records restarts
//! at index `k`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use ltc_adapters::{AdapterContext, AdapterError, HomeRef, SourceAdapter};
use ltc_core::CollectionProgress;
use ltc_storage::{ArtifactStore, CheckpointStore, HttpFetcher, RateLimiter, Unlimited};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_CHECKPOINT_EVERY: usize = 25;

/// Why a single home produced no record. Never aborts the batch.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ItemFetcher: Send + Sync {
    type Record: Send + Sync;

    async fn fetch_item(&self, item: &HomeRef) -> Result<Self::Record, ItemError>;
}

/// Fetches and parses one home through a [`SourceAdapter`], keeping the raw
/// page in the artifact store when one is configured.
pub struct AdapterItemFetcher<A> {
    adapter: Arc<A>,
    http: Arc<HttpFetcher>,
    ctx: AdapterContext,
    artifacts: Option<ArtifactStore>,
}

impl<A: SourceAdapter> AdapterItemFetcher<A> {
    pub fn new(adapter: Arc<A>, http: Arc<HttpFetcher>, ctx: AdapterContext) -> Self {
        Self {
            adapter,
            http,
            ctx,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

#[async_trait]
impl<A: SourceAdapter> ItemFetcher for AdapterItemFetcher<A> {
    type Record = A::Record;

    async fn fetch_item(&self, item: &HomeRef) -> Result<A::Record, ItemError> {
        let page = self.adapter.fetch_detail(&self.http, &self.ctx, item).await?;

        if let Some(store) = &self.artifacts {
            match store
                .store_page(page.fetched_at, self.adapter.source_id(), "html", &page.body)
                .await
            {
                Ok(stored) => debug!(path = %stored.relative_path.display(), "stored raw page"),
                Err(err) => warn!(home = %item.name, error = ?err, "could not store raw page"),
            }
        }

        Ok(self.adapter.parse_detail(item, &page)?)
    }
}

/// Where checkpoints and the final result go.
#[async_trait]
pub trait ProgressSink<R: Sync>: Send + Sync {
    async fn checkpoint(&self, progress: &CollectionProgress<R>) -> anyhow::Result<()>;
    async fn complete(&self, progress: &CollectionProgress<R>) -> anyhow::Result<()>;
}

/// Writes `<source>.progress.json` on every checkpoint and, on completion,
/// both the checkpoint and the raw output `<source>.json`.
pub struct FileProgressSink {
    store: CheckpointStore,
    source_id: String,
}

impl FileProgressSink {
    pub fn new(store: CheckpointStore, source_id: impl Into<String>) -> Self {
        Self {
            store,
            source_id: source_id.into(),
        }
    }
}

#[async_trait]
impl<R: Serialize + Sync> ProgressSink<R> for FileProgressSink {
    async fn checkpoint(&self, progress: &CollectionProgress<R>) -> anyhow::Result<()> {
        self.store.save_progress(&self.source_id, progress).await
    }

    async fn complete(&self, progress: &CollectionProgress<R>) -> anyhow::Result<()> {
        self.store
            .save_progress(&self.source_id, progress)
            .await
            .with_context(|| format!("writing final checkpoint of {}", self.source_id))?;
        self.store
            .save_output(&self.source_id, progress)
            .await
            .with_context(|| format!("writing raw output of {}", self.source_id))
    }
}

pub struct BatchCollector {
    source_id: String,
    checkpoint_every: usize,
    item_timeout: Duration,
    limiter: Arc<dyn RateLimiter>,
    source_label: Option<String>,
    source_url: Option<String>,
}

impl BatchCollector {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            item_timeout: Duration::from_secs(30),
            limiter: Arc::new(Unlimited),
            source_label: None,
            source_url: None,
        }
    }

    pub fn checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every.max(1);
        self
    }

    pub fn item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Provenance stamped into the progress file.
    pub fn provenance(mut self, label: impl Into<String>, url: impl Into<String>) -> Self {
        self.source_label = Some(label.into());
        self.source_url = Some(url.into());
        self
    }

    /// Collect `items`, continuing from `resume` when given.
    ///
    /// Per-item failures are counted and skipped. Only a failed final write
    /// is returned as an error; the last checkpoint is left in place.
    pub async fn run<F, S>(
        &self,
        items: &[HomeRef],
        fetcher: &F,
        sink: &S,
        resume: Option<CollectionProgress<F::Record>>,
    ) -> anyhow::Result<CollectionProgress<F::Record>>
    where
        F: ItemFetcher,
        S: ProgressSink<F::Record>,
    {
        let span = info_span!("collect", source_id = %self.source_id, total = items.len());
        self.run_inner(items, fetcher, sink, resume).instrument(span).await
    }

    async fn run_inner<F, S>(
        &self,
        items: &[HomeRef],
        fetcher: &F,
        sink: &S,
        resume: Option<CollectionProgress<F::Record>>,
    ) -> anyhow::Result<CollectionProgress<F::Record>>
    where
        F: ItemFetcher,
        S: ProgressSink<F::Record>,
    {
        let mut progress = match resume {
            Some(mut progress) => {
                progress.successful = progress.homes.len();
                progress.failed = 0;
                progress.completed_at = None;
                progress
            }
            None => CollectionProgress::new(Utc::now()),
        };
        if progress.source.is_none() {
            progress.source = self.source_label.clone();
        }
        if progress.url.is_none() {
            progress.url = self.source_url.clone();
        }
        if progress.homes.is_empty() {
            // Replaces any checkpoint left by an earlier run, so a completed
            // one never stands in for this run.
            if let Err(err) = sink.checkpoint(&progress).await {
                warn!(error = ?err, "initial checkpoint write failed; continuing");
            }
        }

        let start = progress.homes.len().min(items.len());
        if start > 0 {
            info!(start, remaining = items.len() - start, "resuming from checkpoint");
        }

        for (index, item) in items.iter().enumerate().skip(start) {
            self.limiter.acquire().await;

            let outcome = match tokio::time::timeout(self.item_timeout, fetcher.fetch_item(item)).await {
                Ok(result) => result,
                Err(_) => Err(ItemError::Timeout(self.item_timeout)),
            };
            match outcome {
                Ok(record) => {
                    progress.homes.push(record);
                    progress.successful += 1;
                    debug!(index, home = %item.name, "collected");
                }
                Err(err) => {
                    progress.failed += 1;
                    warn!(index, home = %item.name, error = %err, "item failed");
                }
            }

            let processed = index + 1;
            if processed % self.checkpoint_every == 0 {
                progress.total_attempted = processed;
                match sink.checkpoint(&progress).await {
                    Ok(()) => info!(
                        processed,
                        successful = progress.successful,
                        failed = progress.failed,
                        "checkpoint saved"
                    ),
                    Err(err) => warn!(processed, error = ?err, "checkpoint write failed; continuing"),
                }
            }
        }

        progress.total_attempted = items.len();
        progress.completed_at = Some(Utc::now());
        sink.complete(&progress).await?;
        info!(
            successful = progress.successful,
            failed = progress.failed,
            "collection complete"
        );
        Ok(progress)
    }
}
