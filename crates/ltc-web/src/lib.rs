//! Axum JSON API serving the reconciled LTC dataset to the dashboard.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use ltc_core::distance::{city_coordinates, within_radius, DOWNTOWN_TORONTO};
use ltc_core::{CacheSnapshot, FacilityRecord};
use ltc_storage::{CacheStore, CheckpointStore};
use ltc_sync::{load_serving_data, SourceKind, SourceRegistry, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ltc-web";

const SAMPLE_HOMES: &str = include_str!("sample_homes.json");
const REFRESH_NOTE: &str = "Data is refreshed every 24 hours";
const SAMPLE_NOTE: &str = "Sample data shown while the live dataset loads";
const DEFAULT_RADIUS_KM: f64 = 40.0;
const COLD_START_POLL: Duration = Duration::from_millis(25);

/// Built-in fallback homes, served verbatim when no dataset is available.
pub fn sample_homes() -> Vec<Value> {
    serde_json::from_str(SAMPLE_HOMES).unwrap_or_default()
}

/// Source of fresh data for a background refresh.
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Vec<FacilityRecord>>>;
}

/// Reads the merged dataset, falling back to the metrics source's raw file.
pub struct FileRefresher {
    merged_path: PathBuf,
    metrics_raw_path: PathBuf,
}

impl FileRefresher {
    pub fn new(merged_path: impl Into<PathBuf>, metrics_raw_path: impl Into<PathBuf>) -> Self {
        Self {
            merged_path: merged_path.into(),
            metrics_raw_path: metrics_raw_path.into(),
        }
    }
}

#[async_trait]
impl Refresher for FileRefresher {
    async fn load(&self) -> anyhow::Result<Option<Vec<FacilityRecord>>> {
        load_serving_data(&self.merged_path, &self.metrics_raw_path).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServeSettings {
    pub port: u16,
    pub stale_after: chrono::Duration,
    /// How long a request waits for the first load before serving samples.
    pub cold_start_grace: Duration,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            port: 3001,
            stale_after: chrono::Duration::hours(24),
            cold_start_grace: Duration::from_secs(2),
        }
    }
}

impl ServeSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("LTC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            stale_after: std::env::var("LTC_CACHE_MAX_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(chrono::Duration::hours)
                .unwrap_or(defaults.stale_after),
            ..defaults
        }
    }
}

/// Shared serving state: the current snapshot plus the single-refresh flag.
pub struct AppState {
    cache: CacheStore,
    snapshot: RwLock<Option<Arc<CacheSnapshot>>>,
    refresh_in_flight: AtomicBool,
    refresher: Arc<dyn Refresher>,
    settings: ServeSettings,
}

impl AppState {
    pub fn new(cache: CacheStore, refresher: Arc<dyn Refresher>, settings: ServeSettings) -> Self {
        Self {
            cache,
            snapshot: RwLock::new(None),
            refresh_in_flight: AtomicBool::new(false),
            refresher,
            settings,
        }
    }

    pub fn settings(&self) -> &ServeSettings {
        &self.settings
    }

    /// Adopt the persisted cache, if any.
    pub async fn load_cache(&self) -> bool {
        match self.cache.load().await {
            Some(snapshot) => {
                *self.snapshot.write().await = Some(Arc::new(snapshot));
                true
            }
            None => false,
        }
    }

    /// Adopt the persisted cache and start loading the dataset when it is
    /// missing or stale, so the first request does not wait for it. Returns
    /// whether a refresh was started.
    pub async fn warm_up(self: &Arc<Self>) -> bool {
        if !self.load_cache().await {
            info!("no cache file; loading dataset in the background");
        }
        let snapshot = self.snapshot().await;
        self.needs_refresh(snapshot.as_deref()) && self.trigger_refresh()
    }

    pub async fn snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        self.snapshot.read().await.clone()
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.refresh_in_flight.load(Ordering::Acquire)
    }

    fn needs_refresh(&self, snapshot: Option<&CacheSnapshot>) -> bool {
        snapshot.map_or(true, |s| s.is_stale(Utc::now(), self.settings.stale_after))
    }

    /// Start a background refresh unless one is already running. Returns
    /// whether this call started it.
    pub fn trigger_refresh(self: &Arc<Self>) -> bool {
        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("refresh already in progress");
            return false;
        }

        let state = Arc::clone(self);
        tokio::spawn(async move {
            match state.refresh_now().await {
                Ok(true) => {}
                Ok(false) => warn!("refresh found no dataset; keeping current data"),
                Err(err) => warn!(error = ?err, "refresh failed; keeping current data"),
            }
            state.refresh_in_flight.store(false, Ordering::Release);
        });
        true
    }

    /// Replace the snapshot with freshly loaded data. A non-empty dataset is
    /// adopted even when persisting it to the cache file fails.
    async fn refresh_now(&self) -> anyhow::Result<bool> {
        let data = match self.refresher.load().await? {
            Some(data) if !data.is_empty() => data,
            _ => return Ok(false),
        };

        let snapshot = self.cache.stamp(data);
        if let Err(err) = self.cache.write(&snapshot).await {
            warn!(error = ?err, "could not persist cache");
        }
        info!(entries = snapshot.data.len(), "dataset refreshed");
        *self.snapshot.write().await = Some(Arc::new(snapshot));
        Ok(true)
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/ltc-homes", get(homes_handler))
        .route("/api/ltc-homes/{name}", get(home_detail_handler))
        .route("/api/regions", get(regions_handler))
        .route("/api/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    let metrics = registry.source_of_kind(SourceKind::Metrics)?;

    let cache = CacheStore::new(config.cache_path(), &metrics.display_name, &metrics.listing_url);
    let refresher = FileRefresher::new(
        config.merged_path(),
        CheckpointStore::new(&config.data_dir).output_path(&metrics.source_id),
    );
    let settings = ServeSettings::from_env();
    let state = Arc::new(AppState::new(cache, Arc::new(refresher), settings));

    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    info!(port = settings.port, "serving LTC API");
    state.warm_up().await;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HomesEnvelope<T> {
    data: T,
    last_updated: Option<DateTime<Utc>>,
    source: String,
    note: &'static str,
}

#[derive(Debug, Deserialize, Default)]
struct HomesQuery {
    near: Option<String>,
    radius_km: Option<f64>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn homes_handler(State(state): State<Arc<AppState>>, Query(query): Query<HomesQuery>) -> Response {
    let mut snapshot = state.snapshot().await;
    if state.needs_refresh(snapshot.as_deref()) {
        state.trigger_refresh();
        if snapshot.is_none() {
            debug!("waiting for initial data load");
            let deadline = Instant::now() + state.settings.cold_start_grace;
            while state.refresh_in_flight() && Instant::now() < deadline {
                tokio::time::sleep(COLD_START_POLL).await;
            }
            snapshot = state.snapshot().await;
        }
    }

    let Some(snapshot) = snapshot else {
        return Json(HomesEnvelope {
            data: sample_homes(),
            last_updated: None,
            source: "sample".to_string(),
            note: SAMPLE_NOTE,
        })
        .into_response();
    };

    let data: Vec<&FacilityRecord> = if query.near.is_some() || query.radius_km.is_some() {
        let center = match query.near.as_deref() {
            Some(city) => match city_coordinates(city) {
                Some(coords) => coords,
                None => return error_response(StatusCode::BAD_REQUEST, format!("Unknown city: {city}")),
            },
            None => DOWNTOWN_TORONTO,
        };
        within_radius(&snapshot.data, center, query.radius_km.unwrap_or(DEFAULT_RADIUS_KM))
    } else {
        snapshot.data.iter().collect()
    };

    Json(HomesEnvelope {
        data,
        last_updated: Some(snapshot.last_updated),
        source: snapshot.source.clone(),
        note: REFRESH_NOTE,
    })
    .into_response()
}

async fn home_detail_handler(State(state): State<Arc<AppState>>, AxumPath(name): AxumPath<String>) -> Response {
    let needle = name.to_lowercase();
    let found = match state.snapshot().await {
        Some(snapshot) => snapshot
            .data
            .iter()
            .find(|home| home.name.to_lowercase().contains(&needle))
            .and_then(|home| serde_json::to_value(home).ok()),
        None => sample_homes().into_iter().find(|home| {
            home["name"]
                .as_str()
                .is_some_and(|n| n.to_lowercase().contains(&needle))
        }),
    };

    match found {
        Some(home) => Json(home).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Home not found"),
    }
}

async fn regions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let regions: BTreeSet<String> = match state.snapshot().await {
        Some(snapshot) => snapshot
            .data
            .iter()
            .filter_map(|home| home.region.clone())
            .collect(),
        None => sample_homes()
            .iter()
            .filter_map(|home| home["region"].as_str().map(ToString::to_string))
            .collect(),
    };
    Json(regions.into_iter().collect())
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "message": "Server is running" }))
}
