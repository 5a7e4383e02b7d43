//! The engine context: one instance per configured credential set.
//!
//! All mutable state lives here rather than in globals. Update cycles are
//! serialized by `update_lock` and option changes by `options_lock`; queries
//! take a read lock on `state` and so never observe a half-finished rebuild.

mod pipeline;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{Config, EngineConfig};
use crate::domain::{EstimateField, ForecastRecord, Site};
use crate::forecast::{
    day_summary, energy_wh_hours, local_midnight, local_today, DampeningView, DaySummary,
    ForecastView, HardLimit, LocalRecord, Rebuilt, SensorValues, ValidationError, ALL_SITES,
};
use crate::quota::QuotaTracker;
use crate::solcast::ForecastSource;
use crate::storage::{LoadStatus, OptionsStore, ResponseCache, RuntimeOptions, SnapshotStore};
use crate::store::{AggregateSeries, ForecastStore};

/// Minimum spacing between scheduled fetches
pub const UPDATE_GUARD_MINUTES: i64 = 15;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    FetchingSites,
    FetchingUsage,
    FetchingForecasts,
    Merging,
    Rebuilding,
    Persisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SitesStatus {
    /// Every credential answered but none owns a site
    NoSites,
    /// A credential failed and had no cached sites
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartStatus {
    Starting,
    Ready,
    /// Stored history had schema `found`; it was discarded and refetched
    DataIncompatible { found: u64 },
    Sites { reason: SitesStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Honours the 15 minute guard
    Scheduled,
    Forced,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub updated: Vec<String>,
    /// Sites served from the response cache after the API failed
    pub from_cache: Vec<String>,
    pub quota_skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    AlreadyRunning,
    TooSoon { last_updated: DateTime<Utc> },
    Completed(CycleReport),
}

/// Derived values for the host, on top of the aggregate sensors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensors {
    #[serde(flatten)]
    pub forecast: SensorValues,
    /// Today's kWh per site
    pub site_totals: BTreeMap<String, f64>,
    pub api_used: u32,
    pub api_limit: u32,
    pub last_updated: DateTime<Utc>,
    pub hard_limit: String,
    pub dampening_mode: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub status: StartStatus,
    pub phase: UpdatePhase,
    pub sites: Vec<Site>,
    pub records: usize,
    pub last_updated: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
}

struct EngineState {
    status: StartStatus,
    phase: UpdatePhase,
    sites: Vec<Site>,
    store: ForecastStore,
    rebuilt: Rebuilt,
    options: RuntimeOptions,
    last_updated: DateTime<Utc>,
    last_attempt: Option<DateTime<Utc>>,
}

pub struct SolcastEngine {
    source: Arc<dyn ForecastSource>,
    api_keys: Vec<String>,
    engine_cfg: EngineConfig,
    tz: Tz,
    stale_after: Duration,
    clock: Clock,
    cache: ResponseCache,
    snapshots: SnapshotStore,
    options_store: OptionsStore,
    quota: Mutex<QuotaTracker>,
    state: RwLock<EngineState>,
    update_lock: Mutex<()>,
    options_lock: Mutex<()>,
}

/// Shared handle for the HTTP layer and the scheduler
#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub engine: Arc<SolcastEngine>,
}

impl AppState {
    pub fn new(cfg: Config, source: Arc<dyn ForecastSource>) -> Result<Self> {
        let engine = Arc::new(SolcastEngine::new(&cfg, source)?);
        Ok(Self { cfg, engine })
    }
}

impl SolcastEngine {
    pub fn new(cfg: &Config, source: Arc<dyn ForecastSource>) -> Result<Self> {
        let api_keys = cfg.solcast.api_keys();
        if api_keys.is_empty() {
            anyhow::bail!("at least one API key is required");
        }
        let dir = cfg.storage.data_dir.clone();
        std::fs::create_dir_all(&dir)?;

        let options = RuntimeOptions::from_config(&cfg.engine, api_keys.len())?;
        Ok(Self {
            source,
            engine_cfg: cfg.engine.clone(),
            tz: cfg.engine.time_zone,
            stale_after: Duration::hours(cfg.scheduler.stale_after_hours),
            clock: Arc::new(Utc::now),
            cache: ResponseCache::new(&dir, api_keys.len()),
            snapshots: SnapshotStore::new(&dir),
            options_store: OptionsStore::new(&dir),
            quota: Mutex::new(QuotaTracker::new(&dir, api_keys.clone())),
            state: RwLock::new(EngineState {
                status: StartStatus::Starting,
                phase: UpdatePhase::Idle,
                sites: Vec::new(),
                store: ForecastStore::new(),
                rebuilt: Rebuilt::default(),
                options,
                last_updated: DateTime::<Utc>::default(),
                last_attempt: None,
            }),
            update_lock: Mutex::new(()),
            options_lock: Mutex::new(()),
            api_keys,
        })
    }

    /// Replace the wall clock, for tests and simulations
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    pub fn api_keys(&self) -> &[String] {
        &self.api_keys
    }

    /// Fetch sites and usage, load options and the snapshot, then fetch
    /// whatever history is missing.
    pub async fn start(&self) -> Result<StartStatus, EngineError> {
        let _cycle = self.update_lock.lock().await;
        let now = self.now();

        let sites = match self.fetch_sites().await {
            Ok(sites) => sites,
            Err(reason) => {
                let status = StartStatus::Sites { reason };
                self.state.write().await.status = status;
                return Ok(status);
            }
        };
        self.fetch_usage().await;

        let defaults = RuntimeOptions::from_config(&self.engine_cfg, self.api_keys.len())?;
        let options = self.options_store.load_or_init(defaults).await?;
        {
            let mut state = self.state.write().await;
            state.sites = sites.clone();
            state.options = options;
        }

        let status = match self.snapshots.load().await {
            LoadStatus::Loaded(snapshot) => {
                let mut store = ForecastStore::from_sites(snapshot.siteinfo);
                let configured: HashSet<&str> = sites.iter().map(|s| s.resource_id.as_str()).collect();
                let removed = store.retain_sites(&configured);
                if !removed.is_empty() {
                    info!(sites = ?removed, "dropped history for sites no longer configured");
                }
                let missing: Vec<Site> = sites
                    .iter()
                    .filter(|s| !store.contains(&s.resource_id))
                    .cloned()
                    .collect();

                {
                    let mut state = self.state.write().await;
                    state.store = store;
                    state.last_updated = snapshot.last_updated;
                    state.last_attempt = snapshot.last_attempt;
                    state.status = StartStatus::Ready;
                }

                if missing.is_empty() {
                    self.rebuild_and_persist(now).await;
                } else {
                    info!(sites = missing.len(), "fetching history for newly configured sites");
                    self.run_cycle(&missing, true, false).await;
                }
                StartStatus::Ready
            }
            LoadStatus::Incompatible { found } => {
                warn!(found, "snapshot schema is incompatible, refetching full history");
                self.state.write().await.status = StartStatus::Ready;
                let report = self.run_cycle(&sites, true, true).await;
                if !report.success {
                    warn!(failed = report.failed.len(), "history refetch incomplete");
                }
                StartStatus::DataIncompatible { found }
            }
            other => {
                if let LoadStatus::Corrupt(reason) = other {
                    warn!(%reason, "snapshot unusable, fetching full history");
                }
                self.state.write().await.status = StartStatus::Ready;
                let report = self.run_cycle(&sites, true, true).await;
                if !report.success {
                    warn!(failed = report.failed.len(), "initial fetch incomplete");
                }
                StartStatus::Ready
            }
        };

        info!(sites = sites.len(), keys = self.api_keys.len(), "engine started");
        Ok(status)
    }

    /// Run one update cycle unless another is in flight
    pub async fn update_forecast(&self, mode: UpdateMode) -> Result<UpdateOutcome, EngineError> {
        let Ok(_cycle) = self.update_lock.try_lock() else {
            info!("update already in progress, ignoring trigger");
            return Ok(UpdateOutcome::AlreadyRunning);
        };

        let now = self.now();
        let (sites, last_updated) = {
            let state = self.state.read().await;
            (state.sites.clone(), state.last_updated)
        };

        if mode == UpdateMode::Scheduled && now < last_updated + Duration::minutes(UPDATE_GUARD_MINUTES) {
            info!(%last_updated, "last update is too recent, not fetching");
            return Ok(UpdateOutcome::TooSoon { last_updated });
        }

        Ok(UpdateOutcome::Completed(self.run_cycle(&sites, false, true).await))
    }

    /// Forget all history and fetch it again with a backfill
    pub async fn clear_and_refetch(&self) -> Result<UpdateOutcome, EngineError> {
        let Ok(_cycle) = self.update_lock.try_lock() else {
            return Ok(UpdateOutcome::AlreadyRunning);
        };

        self.snapshots.delete().await.map_err(anyhow::Error::from)?;
        {
            let mut state = self.state.write().await;
            state.store.clear();
            state.rebuilt = Rebuilt::default();
            state.last_updated = DateTime::<Utc>::default();
        }
        warn!("stored history cleared, fetching again");

        let sites = match self.fetch_sites().await {
            Ok(sites) => sites,
            Err(reason) => {
                let status = StartStatus::Sites { reason };
                self.state.write().await.status = status;
                return Err(anyhow::anyhow!("sites unavailable: {reason:?}").into());
            }
        };
        self.fetch_usage().await;
        {
            let mut state = self.state.write().await;
            state.sites = sites.clone();
            state.status = StartStatus::Ready;
        }

        Ok(UpdateOutcome::Completed(self.run_cycle(&sites, true, true).await))
    }

    pub async fn get_dampening(&self, site: Option<&str>) -> Result<DampeningView, EngineError> {
        let state = self.state.read().await;
        if let Some(site) = site.filter(|s| *s != ALL_SITES) {
            if !state.sites.iter().any(|s| s.resource_id == site) {
                return Err(ValidationError::UnknownSite(site.to_string()).into());
            }
        }
        Ok(state.options.dampening.view(site))
    }

    /// Validate and apply new factors, then rebuild and persist options
    pub async fn set_dampening(&self, factors_csv: &str, site: Option<&str>) -> Result<(), EngineError> {
        let known: Vec<String> = {
            let state = self.state.read().await;
            state.sites.iter().map(|s| s.resource_id.clone()).collect()
        };
        self.update_options(|current| {
            let dampening = current.dampening.with_factors(factors_csv, site, known.as_slice())?;
            info!(site = site.unwrap_or("-"), mode = dampening.mode(), "dampening changed");
            Ok(RuntimeOptions {
                dampening,
                ..current.clone()
            })
        })
        .await
    }

    pub async fn set_hard_limit(&self, limit_csv: &str) -> Result<(), EngineError> {
        let hard_limit = HardLimit::parse(limit_csv, self.api_keys.len())?;
        info!(hard_limit = %hard_limit, "hard limit changed");
        self.set_limit(hard_limit).await
    }

    pub async fn remove_hard_limit(&self) -> Result<(), EngineError> {
        info!("hard limit removed");
        self.set_limit(HardLimit::unlimited()).await
    }

    async fn set_limit(&self, hard_limit: HardLimit) -> Result<(), EngineError> {
        self.update_options(|current| {
            Ok(RuntimeOptions {
                hard_limit,
                ..current.clone()
            })
        })
        .await
    }

    /// Choose which estimate feeds sensors and tallies
    pub async fn set_key_estimate(&self, field: EstimateField) -> Result<(), EngineError> {
        self.update_options(|current| {
            Ok(RuntimeOptions {
                key_estimate: field,
                ..current.clone()
            })
        })
        .await
    }

    pub async fn options(&self) -> RuntimeOptions {
        self.state.read().await.options.clone()
    }

    /// Read, change and persist the options as one step.
    ///
    /// Changes are applied one at a time so none is lost to a concurrent
    /// writer. The file is saved before the running options change, so a
    /// failed write leaves them untouched.
    async fn update_options(
        &self,
        change: impl FnOnce(&RuntimeOptions) -> Result<RuntimeOptions, EngineError>,
    ) -> Result<(), EngineError> {
        let _guard = self.options_lock.lock().await;
        let current = self.state.read().await.options.clone();
        let options = change(&current)?;
        self.options_store.save(&options).await?;
        self.state.write().await.options = options;
        self.rebuild_and_persist(self.now()).await;
        Ok(())
    }

    /// Records overlapping `[start, end)` with local start times.
    ///
    /// With a site the raw stored series is used; otherwise the aggregate,
    /// undampened on request. The whole history is searched.
    pub async fn query_forecast_data(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        site: Option<&str>,
        undampened: bool,
    ) -> Result<Vec<LocalRecord>, EngineError> {
        if start >= end {
            return Err(ValidationError::EmptyWindow.into());
        }
        let state = self.state.read().await;

        let to_local = |records: &[ForecastRecord]| -> Vec<LocalRecord> {
            records.iter().map(|r| LocalRecord::from_record(r, &self.tz)).collect()
        };

        match site {
            Some(site) => {
                let series = state
                    .store
                    .site(site)
                    .ok_or_else(|| ValidationError::UnknownSite(site.to_string()))?;
                let day_start = local_midnight(&self.tz, local_today(&self.tz, self.now()));
                let raw = AggregateSeries::new(series.forecasts.clone(), day_start);
                Ok(to_local(raw.slice(start, end, true)))
            }
            None if undampened => Ok(to_local(state.rebuilt.undampened.slice(start, end, true))),
            None => Ok(to_local(state.rebuilt.aggregate.slice(start, end, true))),
        }
    }

    /// Half-hourly and hourly detail for local day `today + offset`
    pub async fn day(&self, offset: i64) -> DaySummary {
        let state = self.state.read().await;
        let today = local_today(&self.tz, self.now());
        day_summary(&state.rebuilt.aggregate, &self.tz, today, offset)
    }

    pub async fn sensors(&self) -> Sensors {
        let (api_used, api_limit) = self.quota.lock().await.totals();
        let state = self.state.read().await;
        let field = state.options.key_estimate;
        let view = ForecastView::new(&state.rebuilt.aggregate, field, self.tz, self.now());

        Sensors {
            forecast: view.sensors(state.options.custom_hours),
            site_totals: state
                .store
                .sites()
                .filter_map(|(id, _)| state.store.tally(id).map(|t| (id.clone(), t)))
                .collect(),
            api_used,
            api_limit,
            last_updated: state.last_updated,
            hard_limit: state.options.hard_limit.to_string(),
            dampening_mode: state.options.dampening.mode(),
        }
    }

    /// Today's kWh for one site, if it has been rebuilt
    pub async fn site_total_today(&self, site: &str) -> Option<f64> {
        self.state.read().await.store.tally(site)
    }

    pub async fn energy_wh_hours(&self) -> BTreeMap<DateTime<Utc>, f64> {
        let state = self.state.read().await;
        energy_wh_hours(&state.rebuilt.aggregate, state.options.key_estimate)
    }

    /// Zero the per-key usage counters at the remote's daily reset
    pub async fn reset_api_usage(&self) {
        self.quota.lock().await.reset().await;
    }

    /// Point both aggregates' start-of-today cursor at the current local day
    pub async fn roll_day(&self) {
        let day_start = local_midnight(&self.tz, local_today(&self.tz, self.now()));
        let mut state = self.state.write().await;
        state.rebuilt.aggregate.reanchor(day_start);
        state.rebuilt.undampened.reanchor(day_start);
        info!(%day_start, cursor = state.rebuilt.aggregate.start_index(), "local day rolled over");
    }

    pub async fn status(&self) -> EngineStatus {
        let state = self.state.read().await;
        EngineStatus {
            status: state.status,
            phase: state.phase,
            sites: state.sites.clone(),
            records: state.rebuilt.aggregate.len(),
            last_updated: state.last_updated,
            last_attempt: state.last_attempt,
        }
    }

    /// No successful update within the configured staleness window
    pub async fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read().await;
        state.status == StartStatus::Ready && state.last_updated + self.stale_after < now
    }

    /// The last attempt predates the most recent scheduled interval
    pub async fn missed_update(&self, last_interval: DateTime<Utc>) -> bool {
        let state = self.state.read().await;
        state.status == StartStatus::Ready
            && state.last_attempt.is_some_and(|attempt| attempt < last_interval)
    }

    /// Position of each site's key in configured order
    fn credential_index(&self, sites: &[Site]) -> HashMap<String, usize> {
        sites
            .iter()
            .map(|s| {
                let idx = self.api_keys.iter().position(|k| *k == s.api_key).unwrap_or(0);
                (s.resource_id.clone(), idx)
            })
            .collect()
    }
}
