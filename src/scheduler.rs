use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::engine::{SolcastEngine, UpdateMode, UpdateOutcome};
use crate::forecast::{local_midnight, local_today};

/// Periodic task configuration
#[derive(Debug, Clone)]
pub struct PeriodicTaskConfig {
    /// Forecast update interval (seconds), 0 disables automatic updates
    pub update_interval_secs: u64,
    /// Reset API usage counters at UTC midnight
    pub reset_usage_at_midnight: bool,
}

impl Default for PeriodicTaskConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 3600,
            reset_usage_at_midnight: true,
        }
    }
}

impl From<&SchedulerConfig> for PeriodicTaskConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            update_interval_secs: cfg.auto_update_minutes * 60,
            ..Self::default()
        }
    }
}

/// Task status tracking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    fn started(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.run_count += 1;
    }

    fn succeeded(&mut self, now: DateTime<Utc>) {
        self.last_success = Some(now);
        self.success_count += 1;
        self.last_error = None;
    }

    fn failed(&mut self, error: String) {
        self.error_count += 1;
        self.last_error = Some(error);
    }
}

/// Drives forecast updates, the local day rollover and the daily usage reset
pub struct TaskScheduler {
    config: PeriodicTaskConfig,
    engine: Arc<SolcastEngine>,
    update_status: Arc<RwLock<TaskStatus>>,
    usage_reset_status: Arc<RwLock<TaskStatus>>,
}

impl TaskScheduler {
    pub fn new(engine: Arc<SolcastEngine>) -> Self {
        Self::with_config(engine, PeriodicTaskConfig::default())
    }

    pub fn with_config(engine: Arc<SolcastEngine>, config: PeriodicTaskConfig) -> Self {
        Self {
            config,
            engine,
            update_status: Arc::new(RwLock::new(TaskStatus::default())),
            usage_reset_status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    /// Catch up on a stale start or a missed update, then start all periodic tasks
    pub fn start(self: Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.catch_up().await;
            if scheduler.config.update_interval_secs > 0 {
                scheduler.run_update_task().await;
            } else {
                info!("automatic forecast updates disabled");
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_day_rollover_task().await;
        });

        if self.config.reset_usage_at_midnight {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_usage_reset_task().await;
            });
        }

        info!(
            update_interval_secs = self.config.update_interval_secs,
            "periodic tasks started"
        );
    }

    fn every(&self) -> Option<ChronoDuration> {
        match self.config.update_interval_secs {
            0 => None,
            secs => Some(ChronoDuration::seconds(secs as i64)),
        }
    }

    /// Update straight away when a scheduled run was missed or the data is stale
    pub async fn catch_up(&self) -> bool {
        let now = self.engine.now();
        if let Some(every) = self.every() {
            let boundary = last_boundary(now, every);
            if self.engine.missed_update(boundary).await {
                info!(%boundary, "last update is older than the most recent interval, updating forecast");
                self.run_update(UpdateMode::Forced).await;
                return true;
            }
        }
        if self.engine.is_stale(now).await {
            warn!("forecast data is stale, updating forecast");
            self.run_update(UpdateMode::Forced).await;
            return true;
        }
        false
    }

    /// Run periodic forecast updates, aligned to interval boundaries
    async fn run_update_task(&self) {
        let Some(every) = self.every() else {
            return;
        };
        let now = self.engine.now();
        let next = last_boundary(now, every) + every;
        let first = Instant::now() + (next - now).to_std().unwrap_or(Duration::ZERO);

        let mut ticker = interval_at(first, Duration::from_secs(self.config.update_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.run_update(UpdateMode::Scheduled).await;
        }
    }

    pub async fn run_update(&self, mode: UpdateMode) {
        let now = self.engine.now();
        self.update_status.write().await.started(now);

        match self.engine.update_forecast(mode).await {
            Ok(UpdateOutcome::Completed(report)) if report.success => {
                self.update_status.write().await.succeeded(now);
            }
            Ok(UpdateOutcome::Completed(report)) => {
                let message = format!(
                    "{} site(s) failed, {} skipped for quota",
                    report.failed.len(),
                    report.quota_skipped.len()
                );
                warn!(%message, "forecast update incomplete");
                self.update_status.write().await.failed(message);
            }
            Ok(UpdateOutcome::TooSoon { .. }) => {
                self.update_status.write().await.succeeded(now);
            }
            Ok(UpdateOutcome::AlreadyRunning) => {
                info!("forecast update already running, tick skipped");
            }
            Err(e) => {
                error!(error = %e, "forecast update failed");
                self.update_status.write().await.failed(e.to_string());
            }
        }
    }

    /// Move the aggregate's start-of-today cursor at every local midnight
    async fn run_day_rollover_task(&self) {
        let tz = self.engine.time_zone();
        loop {
            let now = self.engine.now();
            let next = next_local_midnight(now, &tz);
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            sleep(wait).await;
            self.engine.roll_day().await;
        }
    }

    /// Reset usage counters at every UTC midnight
    async fn run_usage_reset_task(&self) {
        loop {
            let now = self.engine.now();
            let next = next_utc_midnight(now);
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            info!(next = %next, "next API usage reset scheduled");
            sleep(wait).await;

            let now = self.engine.now();
            self.usage_reset_status.write().await.started(now);
            self.engine.reset_api_usage().await;
            self.usage_reset_status.write().await.succeeded(now);
        }
    }

    pub async fn get_update_status(&self) -> TaskStatus {
        self.update_status.read().await.clone()
    }

    pub async fn get_usage_reset_status(&self) -> TaskStatus {
        self.usage_reset_status.read().await.clone()
    }
}

/// Most recent multiple of `every` since UTC midnight, at or before `now`
pub fn last_boundary(now: DateTime<Utc>, every: ChronoDuration) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc();
    let step = every.num_seconds().max(1);
    let elapsed = (now - midnight).num_seconds();
    midnight + ChronoDuration::seconds(elapsed - elapsed % step)
}

pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + ChronoDuration::days(1))
        .and_time(chrono::NaiveTime::MIN)
        .and_utc()
}

/// First local midnight strictly after `now`
pub fn next_local_midnight(now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    local_midnight(tz, local_today(tz, now) + ChronoDuration::days(1))
}
