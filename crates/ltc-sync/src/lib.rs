//! Collection, reconciliation and export pipeline for the LTC dataset.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ltc_adapters::{AdapterContext, HomeList, HqoMetricsAdapter, PublicReportingAdapter, SourceAdapter};
use ltc_core::{
    FacilityRecord, LocationRecord, MergedDataset, MetricsRecord, RawSourceFile, SourceInfo,
};
use ltc_storage::{
    read_json, write_json_atomic, ArtifactStore, BackoffPolicy, CacheStore, CheckpointStore, Clock,
    FixedIntervalLimiter, HttpClientConfig, HttpFetcher, RateLimiter, SimpleTokenBucket, TokioClock,
    Unlimited,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

mod collector;
mod export;
mod reconcile;

pub use collector::{
    AdapterItemFetcher, BatchCollector, FileProgressSink, ItemError, ItemFetcher, ProgressSink,
    DEFAULT_CHECKPOINT_EVERY,
};
pub use ltc_adapters::SourceKind;
pub use export::{export_snapshots, ParquetManifest, ParquetManifestFile};
pub use reconcile::{reconcile, ReconcileReport, Reconciliation};

pub const CRATE_NAME: &str = "ltc-sync";

pub const MERGED_FILE: &str = "ontario-ltc-merged.json";
pub const CACHE_FILE: &str = "ltc-cache.json";
pub const SNAPSHOT_DIR: &str = "snapshots";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

fn default_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub listing_url: String,
    #[serde(default)]
    pub detail_url: Option<String>,
    #[serde(default)]
    pub detail_query_param: Option<String>,
    #[serde(default)]
    pub item_list_path: Option<PathBuf>,
    pub provides: String,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Requests allowed back to back before `delay_ms` pacing applies.
    #[serde(default)]
    pub burst: Option<u32>,
}

/// Pacing for one source: none at `delay_ms: 0`, a token bucket refilled
/// every `delay_ms` when a burst above one is configured, otherwise one
/// request per `delay_ms`.
pub fn build_limiter<C: Clock + 'static>(source: &SourceConfig, clock: C) -> Arc<dyn RateLimiter> {
    if source.delay_ms == 0 {
        return Arc::new(Unlimited);
    }
    let interval = Duration::from_millis(source.delay_ms);
    match source.burst {
        Some(burst) if burst > 1 => Arc::new(SimpleTokenBucket::new(burst, interval, clock)),
        _ => Arc::new(FixedIntervalLimiter::new(interval, clock)),
    }
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn get(&self, source_id: &str) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.source_id == source_id)
            .with_context(|| format!("unknown source {source_id}"))
    }

    /// The enabled source of `kind`. Exactly one per kind takes part in a merge.
    pub fn source_of_kind(&self, kind: SourceKind) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.enabled && s.kind == kind)
            .with_context(|| format!("no enabled {kind:?} source in registry"))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Extra attempts on throttling, 5xx or connect/timeout failures.
    pub http_retries: usize,
    pub item_timeout_secs: u64,
    pub checkpoint_every: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("LTC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            data_dir: std::env::var("LTC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            artifacts_dir: std::env::var("LTC_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            user_agent: std::env::var("LTC_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_parse("LTC_HTTP_TIMEOUT_SECS", 15),
            http_retries: env_parse("LTC_HTTP_RETRIES", 0),
            item_timeout_secs: env_parse("LTC_ITEM_TIMEOUT_SECS", 30),
            checkpoint_every: env_parse("LTC_CHECKPOINT_EVERY", DEFAULT_CHECKPOINT_EVERY),
            scheduler_enabled: std::env::var("LTC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("LTC_SYNC_CRON").unwrap_or_else(|_| "0 0 3 * * *".to_string()),
        }
    }

    /// Rooted under `dir`, for tests and one-off tooling.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            workspace_root: dir.to_path_buf(),
            data_dir: dir.join("data"),
            artifacts_dir: dir.join("artifacts"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            http_retries: 0,
            item_timeout_secs: 30,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            scheduler_enabled: false,
            sync_cron: "0 0 3 * * *".to_string(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn merged_path(&self) -> PathBuf {
        self.data_dir.join(MERGED_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_DIR)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..Default::default()
            },
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectOptions {
    /// Ignore any checkpoint and start from the first home.
    pub fresh: bool,
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectSummary {
    pub source_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub output_path: String,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub dataset: MergedDataset,
    pub report: ReconcileReport,
    pub merged_path: PathBuf,
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collected: Vec<CollectSummary>,
    pub report: ReconcileReport,
    pub total_homes: usize,
    pub merged_path: String,
    pub parquet_manifest: String,
    pub cache_path: String,
}

/// Clears the in-flight flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    http: Arc<HttpFetcher>,
    checkpoints: CheckpointStore,
    artifacts: ArtifactStore,
    running: AtomicBool,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: SourceRegistry) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        Ok(Self {
            checkpoints: CheckpointStore::new(config.data_dir.clone()),
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            config,
            registry,
            http: Arc::new(http),
            running: AtomicBool::new(false),
        })
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.registry_path()).await?;
        Self::new(config, registry)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn cache_store(&self) -> CacheStore {
        let source = self.registry.source_of_kind(SourceKind::Metrics).ok();
        CacheStore::new(
            self.config.cache_path(),
            source.map_or("Health Quality Ontario", |s| s.display_name.as_str()),
            source.map_or("", |s| s.listing_url.as_str()),
        )
    }

    /// Collect one source to `<data_dir>/<source_id>.json`.
    pub async fn collect_source(&self, source_id: &str, opts: CollectOptions) -> Result<CollectSummary> {
        let source = self.registry.get(source_id)?.clone();
        match source.kind {
            SourceKind::Metrics => {
                let detail_url = source
                    .detail_url
                    .clone()
                    .with_context(|| format!("{source_id}: detail_url is required"))?;
                let item_list = self.home_list_path(&source)?;
                if !fs::try_exists(&item_list).await.unwrap_or(false) {
                    info!(source_id, path = %item_list.display(), "no home list yet; discovering");
                    self.discover_home_list().await?;
                }
                let adapter = HqoMetricsAdapter::new(
                    &source.source_id,
                    detail_url,
                    source.detail_query_param.clone().unwrap_or_else(|| "name".into()),
                    item_list,
                )
                .with_provincial_url(&source.listing_url);
                self.collect_with(&source, adapter, opts).await
            }
            SourceKind::Location => {
                let adapter = PublicReportingAdapter::new(&source.source_id, &source.listing_url);
                self.collect_with(&source, adapter, opts).await
            }
        }
    }

    async fn collect_with<A>(&self, source: &SourceConfig, adapter: A, opts: CollectOptions) -> Result<CollectSummary>
    where
        A: SourceAdapter + 'static,
        A::Record: Serialize + DeserializeOwned,
    {
        let source_id = source.source_id.as_str();
        let adapter = Arc::new(adapter);
        let ctx = AdapterContext::new();

        let mut items = adapter
            .enumerate(&self.http, &ctx)
            .await
            .with_context(|| format!("enumerating homes for {source_id}"))?;
        if let Some(max) = opts.max_items {
            items.truncate(max);
        }
        info!(source_id, run_id = %ctx.run_id, homes = items.len(), "enumerated homes");

        let resume = if opts.fresh {
            None
        } else {
            match self.checkpoints.load_progress::<A::Record>(source_id).await? {
                Some(progress) if progress.is_complete() => {
                    info!(source_id, "previous run completed; starting a new one");
                    None
                }
                other => other,
            }
        };

        let limiter = build_limiter(source, TokioClock);
        let fetcher = AdapterItemFetcher::new(adapter, self.http.clone(), ctx)
            .with_artifacts(self.artifacts.clone());
        let sink = FileProgressSink::new(self.checkpoints.clone(), source_id);

        let progress = BatchCollector::new(source_id)
            .checkpoint_every(self.config.checkpoint_every)
            .item_timeout(Duration::from_secs(self.config.item_timeout_secs))
            .limiter(limiter)
            .provenance(&source.display_name, &source.listing_url)
            .run(&items, &fetcher, &sink, resume)
            .await?;

        Ok(CollectSummary {
            source_id: source_id.to_string(),
            total: items.len(),
            successful: progress.successful,
            failed: progress.failed,
            output_path: self.checkpoints.output_path(source_id).display().to_string(),
        })
    }

    fn home_list_path(&self, source: &SourceConfig) -> Result<PathBuf> {
        source
            .item_list_path
            .as_deref()
            .map(|p| self.config.resolve(p))
            .with_context(|| format!("{}: item_list_path is required", source.source_id))
    }

    /// Build the metrics source's home list from the location source's
    /// listing page.
    pub async fn discover_home_list(&self) -> Result<HomeList> {
        let location = self.registry.source_of_kind(SourceKind::Location)?;
        let adapter = PublicReportingAdapter::new(&location.source_id, &location.listing_url);
        let ctx = AdapterContext::new();
        let homes = adapter
            .enumerate(&self.http, &ctx)
            .await
            .with_context(|| format!("listing homes on {}", location.source_id))?;
        let list = HomeList::from_names(homes.iter().map(|h| h.name.as_str()), Utc::now(), &location.display_name);
        self.write_home_list(&list).await?;
        Ok(list)
    }

    pub async fn write_home_list(&self, list: &HomeList) -> Result<PathBuf> {
        let metrics = self.registry.source_of_kind(SourceKind::Metrics)?;
        let path = self.home_list_path(metrics)?;
        write_json_atomic(&path, list)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), homes = list.homes.len(), "home list written");
        Ok(path)
    }

    async fn load_complete_output<R: DeserializeOwned>(&self, source: &SourceConfig) -> Result<RawSourceFile<R>> {
        let raw: RawSourceFile<R> = self.checkpoints.load_output(&source.source_id).await?;
        if !raw.is_complete() {
            bail!(
                "raw output of {} has no completedAt; the collection run has not finished",
                source.source_id
            );
        }
        Ok(raw)
    }

    /// Reconcile the two raw source files into the merged dataset and its
    /// Parquet snapshot.
    pub async fn merge(&self) -> Result<MergeOutcome> {
        let metrics_source = self.registry.source_of_kind(SourceKind::Metrics)?;
        let location_source = self.registry.source_of_kind(SourceKind::Location)?;

        let metrics: RawSourceFile<MetricsRecord> = self.load_complete_output(metrics_source).await?;
        let locations: RawSourceFile<LocationRecord> = self.load_complete_output(location_source).await?;
        ensure_named(&metrics_source.source_id, metrics.homes.iter().map(|h| h.name.as_str()))?;
        ensure_named(&location_source.source_id, locations.homes.iter().map(|h| h.name.as_str()))?;
        info!(
            metrics = metrics.homes.len(),
            locations = locations.homes.len(),
            "loaded raw source files"
        );

        let Reconciliation { records, report } = reconcile(&metrics.homes, &locations.homes);

        let source_info = |source: &SourceConfig, scraped_at: DateTime<Utc>, url: &Option<String>| SourceInfo {
            name: source.display_name.clone(),
            url: url.clone().or_else(|| Some(source.listing_url.clone())),
            data_date: Some(scraped_at),
            provides: source.provides.clone(),
        };
        let now = Utc::now();
        let dataset = MergedDataset::new(
            now,
            vec![
                source_info(metrics_source, metrics.scraped_at, &metrics.url),
                source_info(location_source, locations.scraped_at, &locations.url),
            ],
            records,
        );

        let merged_path = self.config.merged_path();
        write_json_atomic(&merged_path, &dataset)
            .await
            .with_context(|| format!("writing {}", merged_path.display()))?;
        let manifest_path = export_snapshots(
            &self.config.snapshot_dir(),
            now,
            &dataset.data,
            &self.registry.sources,
        )?;
        info!(
            path = %merged_path.display(),
            total_homes = dataset.total_homes,
            "merged dataset written"
        );

        Ok(MergeOutcome {
            dataset,
            report,
            merged_path,
            manifest_path,
        })
    }

    /// Collect every enabled source, merge, and refresh the serving cache.
    /// Refuses to start while another run is in flight.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            bail!("a sync run is already in progress");
        };
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "sync run started");

        let enabled: Vec<String> = self
            .registry
            .sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.source_id.clone())
            .collect();
        let mut collected = Vec::with_capacity(enabled.len());
        for source_id in &enabled {
            collected.push(self.collect_source(source_id, CollectOptions::default()).await?);
        }

        let merge = self.merge().await?;
        let cache = self.cache_store();
        cache.save(merge.dataset.data.clone()).await?;

        let finished_at = Utc::now();
        info!(%run_id, total_homes = merge.dataset.total_homes, "sync run finished");
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            collected,
            report: merge.report,
            total_homes: merge.dataset.total_homes,
            merged_path: merge.merged_path.display().to_string(),
            parquet_manifest: merge.manifest_path.display().to_string(),
            cache_path: cache.path().display().to_string(),
        })
    }

    /// Poll a source's checkpoint until its run has completed. With no
    /// checkpoint at all, an existing raw output counts as done.
    pub async fn wait_for_completion(&self, source_id: &str, poll_every: Duration) -> Result<()> {
        self.registry.get(source_id)?;
        let mut last_seen = None;
        loop {
            match self.checkpoints.load_progress::<serde_json::Value>(source_id).await {
                Ok(Some(progress)) if progress.is_complete() => {
                    info!(source_id, processed = progress.processed(), "collection completed");
                    return Ok(());
                }
                Ok(Some(progress)) => {
                    let processed = progress.processed();
                    if last_seen != Some(processed) {
                        info!(
                            source_id,
                            processed,
                            successful = progress.successful,
                            failed = progress.failed,
                            "collection in progress"
                        );
                        last_seen = Some(processed);
                    }
                }
                Ok(None) if self.checkpoints.output_exists(source_id).await => {
                    info!(source_id, "raw output present");
                    return Ok(());
                }
                Ok(None) => {}
                Err(err) => warn!(source_id, error = ?err, "could not read checkpoint"),
            }
            tokio::time::sleep(poll_every).await;
        }
    }

    /// A cron scheduler running [`SyncPipeline::run_once`], when enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        total_homes = summary.total_homes,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn ensure_named<'a>(source_id: &str, mut names: impl Iterator<Item = &'a str>) -> Result<()> {
    if let Some(index) = names.position(|name| name.trim().is_empty()) {
        bail!("malformed input: record {index} of {source_id} has an empty name");
    }
    Ok(())
}

/// Records for the serving layer: the merged file when present, else the
/// metrics source's raw file. `Ok(None)` when neither exists.
pub async fn load_serving_data(merged_path: &Path, metrics_raw_path: &Path) -> Result<Option<Vec<FacilityRecord>>> {
    if fs::try_exists(merged_path).await.unwrap_or(false) {
        let dataset: MergedDataset = read_json(merged_path).await?;
        return Ok(Some(dataset.data));
    }
    if fs::try_exists(metrics_raw_path).await.unwrap_or(false) {
        let raw: RawSourceFile<MetricsRecord> = read_json(metrics_raw_path).await?;
        return Ok(Some(raw.homes.iter().map(FacilityRecord::metrics_only).collect()));
    }
    Ok(None)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltc_core::{CollectionProgress, LocationDetails, QualityMetrics, PROVINCIAL_AVERAGE_NAME};
    use ltc_storage::ManualClock;

    const REGISTRY: &str = r#"
sources:
  - source_id: hqo-metrics
    display_name: Health Quality Ontario
    kind: metrics
    enabled: true
    listing_url: https://www.hqontario.ca/System-Performance/Long-Term-Care-Home-Performance
    detail_url: https://www.hqontario.ca/System-Performance/Long-Term-Care-Home-Performance
    detail_query_param: name
    item_list_path: data/ltc-homes-list.json
    provides: Quality metrics and wait times
  - source_id: public-reporting
    display_name: Public Reporting LTC Homes
    kind: location
    enabled: true
    listing_url: https://publicreporting.ltchomes.net/en-ca/Search_Selection.aspx
    provides: Location, LHIN, home details, accreditation
    delay_ms: 0
"#;

    fn pipeline(dir: &Path) -> SyncPipeline {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        SyncPipeline::new(SyncConfig::rooted_at(dir), registry).unwrap()
    }

    fn complete<R>(homes: Vec<R>) -> CollectionProgress<R> {
        let mut progress = CollectionProgress::new(Utc::now());
        progress.total_attempted = homes.len();
        progress.successful = homes.len();
        progress.homes = homes;
        progress.completed_at = Some(Utc::now());
        progress
    }

    fn maple_metrics() -> MetricsRecord {
        MetricsRecord {
            name: "MAPLE MANOR".into(),
            metrics: QualityMetrics {
                falls: Some(8.2),
                ..Default::default()
            },
            is_provincial: false,
        }
    }

    fn maple_location() -> LocationRecord {
        LocationRecord {
            name: "Maple Manor".into(),
            details: LocationDetails {
                city: Some("Ottawa".into()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn registry_parses_kinds_and_defaults() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let metrics = registry.source_of_kind(SourceKind::Metrics).unwrap();
        assert_eq!(metrics.source_id, "hqo-metrics");
        assert_eq!(metrics.delay_ms, 500);
        let location = registry.get("public-reporting").unwrap();
        assert_eq!(location.kind, SourceKind::Location);
        assert_eq!(location.delay_ms, 0);
        assert_eq!(location.burst, None);
        assert!(registry.get("nope").is_err());
    }

    #[tokio::test]
    async fn limiter_follows_source_pacing() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let mut source = registry.get("hqo-metrics").unwrap().clone();

        let clock = Arc::new(ManualClock::new());
        let fixed = build_limiter(&source, clock.clone());
        fixed.acquire().await;
        fixed.acquire().await;
        assert_eq!(clock.sleeps().await, vec![Duration::from_millis(500)]);

        source.burst = Some(3);
        let clock = Arc::new(ManualClock::new());
        let bucket = build_limiter(&source, clock.clone());
        for _ in 0..4 {
            bucket.acquire().await;
        }
        assert_eq!(clock.sleeps().await, vec![Duration::from_millis(500)]);

        source.delay_ms = 0;
        let clock = Arc::new(ManualClock::new());
        let unpaced = build_limiter(&source, clock.clone());
        for _ in 0..4 {
            unpaced.acquire().await;
        }
        assert!(clock.sleeps().await.is_empty());
    }

    #[test]
    fn http_config_carries_timeout_and_retries() {
        let mut config = SyncConfig::rooted_at(Path::new("/srv/ltc"));
        assert_eq!(config.http_config().backoff.max_retries, 0);

        config.http_retries = 2;
        config.http_timeout_secs = 7;
        let http = config.http_config();
        assert_eq!(http.backoff.max_retries, 2);
        assert_eq!(http.timeout, Duration::from_secs(7));
        assert!(http.user_agent.is_some_and(|ua| ua.starts_with("Mozilla/5.0")));
    }

    #[tokio::test]
    async fn home_list_lands_at_metrics_item_list_path() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let list = HomeList::from_names(["Maple Manor", "Riverside"], Utc::now(), "Public Reporting LTC Homes");

        let path = pipeline.write_home_list(&list).await.unwrap();
        assert_eq!(path, dir.path().join("data/ltc-homes-list.json"));
        let back: HomeList = read_json(&path).await.unwrap();
        assert_eq!(back.homes, vec!["MAPLE MANOR", "RIVERSIDE"]);
        assert_eq!(back.total_homes, Some(2));
    }

    #[tokio::test]
    async fn workspace_registry_loads() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let config = SyncConfig::rooted_at(&root);
        let registry = SourceRegistry::load(&config.registry_path()).await.unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert!(registry.sources.iter().all(|s| s.enabled));
        assert!(registry.source_of_kind(SourceKind::Location).is_ok());
    }

    #[test]
    fn config_paths_hang_off_data_dir() {
        let config = SyncConfig::rooted_at(Path::new("/srv/ltc"));
        assert_eq!(config.merged_path(), PathBuf::from("/srv/ltc/data/ontario-ltc-merged.json"));
        assert_eq!(config.cache_path(), PathBuf::from("/srv/ltc/data/ltc-cache.json"));
        assert_eq!(config.registry_path(), PathBuf::from("/srv/ltc/sources.yaml"));
        assert_eq!(
            config.resolve(Path::new("data/list.json")),
            PathBuf::from("/srv/ltc/data/list.json")
        );
    }

    #[tokio::test]
    async fn merge_writes_dataset_with_sources_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let store = pipeline.checkpoints();
        store.save_output("hqo-metrics", &complete(vec![maple_metrics()])).await.unwrap();
        store
            .save_output(
                "public-reporting",
                &complete(vec![
                    maple_location(),
                    LocationRecord {
                        name: "Riverside".into(),
                        details: LocationDetails::default(),
                    },
                ]),
            )
            .await
            .unwrap();

        let outcome = pipeline.merge().await.unwrap();
        assert_eq!(outcome.report.matched, 1);
        assert_eq!(outcome.report.location_only, 1);
        assert!(outcome.manifest_path.exists());

        let written: MergedDataset = read_json(&outcome.merged_path).await.unwrap();
        assert_eq!(written.total_homes, 2);
        assert_eq!(written.data[0].name, "MAPLE MANOR");
        assert_eq!(written.data[0].details.city.as_deref(), Some("Ottawa"));
        assert_eq!(written.sources[0].name, "Health Quality Ontario");
        assert_eq!(written.sources[1].provides, "Location, LHIN, home details, accreditation");
        assert_eq!(written.fields.len(), 20);
    }

    #[tokio::test]
    async fn merge_keeps_provincial_average_at_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let provincial = MetricsRecord {
            name: PROVINCIAL_AVERAGE_NAME.into(),
            metrics: QualityMetrics {
                wait_time_community: Some(128.0),
                ..Default::default()
            },
            is_provincial: true,
        };
        let store = pipeline.checkpoints();
        store
            .save_output("hqo-metrics", &complete(vec![provincial, maple_metrics()]))
            .await
            .unwrap();
        store.save_output("public-reporting", &complete(vec![maple_location()])).await.unwrap();

        let outcome = pipeline.merge().await.unwrap();
        assert_eq!(outcome.report.metrics_only, 1);
        assert_eq!(outcome.report.matched, 1);

        let written: MergedDataset = read_json(&outcome.merged_path).await.unwrap();
        let head = &written.data[0];
        assert_eq!(head.name, "Ontario Provincial Average");
        assert!(head.is_provincial);
        assert_eq!(head.region.as_deref(), Some("Provincial"));
        assert_eq!(head.metrics.wait_time_hospital, None);
        assert!(!written.data[1].is_provincial);
    }

    #[tokio::test]
    async fn merge_refuses_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        pipeline
            .checkpoints()
            .save_output("hqo-metrics", &complete(vec![maple_metrics()]))
            .await
            .unwrap();

        let err = pipeline.merge().await.unwrap_err();
        assert!(format!("{err:#}").contains("public-reporting"));
        assert!(!pipeline.config().merged_path().exists());
    }

    #[tokio::test]
    async fn merge_refuses_unfinished_run() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let mut unfinished = complete(vec![maple_metrics()]);
        unfinished.completed_at = None;
        let store = pipeline.checkpoints();
        store.save_output("hqo-metrics", &unfinished).await.unwrap();
        store.save_output("public-reporting", &complete(vec![maple_location()])).await.unwrap();

        let err = pipeline.merge().await.unwrap_err();
        assert!(err.to_string().contains("completedAt"));
    }

    #[tokio::test]
    async fn merge_rejects_empty_names() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let mut nameless = maple_location();
        nameless.name = "  ".into();
        let store = pipeline.checkpoints();
        store.save_output("hqo-metrics", &complete(vec![maple_metrics()])).await.unwrap();
        store.save_output("public-reporting", &complete(vec![nameless])).await.unwrap();

        let err = pipeline.merge().await.unwrap_err();
        assert!(err.to_string().contains("malformed input"));
    }

    #[tokio::test]
    async fn serving_data_prefers_merged_then_metrics_raw() {
        let dir = tempfile::tempdir().unwrap();
        let merged = dir.path().join(MERGED_FILE);
        let raw = dir.path().join("hqo-metrics.json");

        assert!(load_serving_data(&merged, &raw).await.unwrap().is_none());

        write_json_atomic(&raw, &complete(vec![maple_metrics()])).await.unwrap();
        let data = load_serving_data(&merged, &raw).await.unwrap().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].details.city, None);

        let dataset = MergedDataset::new(
            Utc::now(),
            vec![],
            vec![FacilityRecord::merged(&maple_metrics(), &maple_location())],
        );
        write_json_atomic(&merged, &dataset).await.unwrap();
        let data = load_serving_data(&merged, &raw).await.unwrap().unwrap();
        assert_eq!(data[0].region.as_deref(), Some("Ottawa"));
    }

    #[tokio::test]
    async fn monitor_returns_once_output_appears() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(dir.path()));
        let store = pipeline.checkpoints().clone();

        let mut partial = complete(vec![maple_metrics()]);
        partial.completed_at = None;
        store.save_progress("hqo-metrics", &partial).await.unwrap();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.save_progress("hqo-metrics", &complete(vec![maple_metrics()])).await.unwrap();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.wait_for_completion("hqo-metrics", Duration::from_millis(5)),
        )
        .await
        .unwrap()
        .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_run_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let _held = RunGuard::acquire(&pipeline.running).unwrap();

        let err = pipeline.run_once().await.unwrap_err();
        assert!(err.to_string().contains("already in progress"));
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(dir.path()));
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }
}
