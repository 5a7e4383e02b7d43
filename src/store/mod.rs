//! Time-series store: per-site forecast history plus the merged aggregate.
//!
//! Site series are only mutated through [`ForecastStore::merge`], which keeps
//! each series sorted, unique by `period_start` and pruned to the retention
//! window. Every step is idempotent, so a store that was interrupted half way
//! through an update cycle is still valid.

pub mod aggregate;

pub use aggregate::*;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::domain::{ForecastRecord, SiteSeries};
use crate::forecast::{local_midnight, local_today};

/// Days of history kept per site
pub const HISTORY_DAYS: i64 = 730;

/// Days ahead of local midnight that forecasts are requested and kept for
pub const FORECAST_DAYS: i64 = 8;

/// Outcome of a merge, for logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub pruned: usize,
    pub total: usize,
}

/// Per-site series keyed by resource id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastStore {
    sites: BTreeMap<String, SiteSeries>,
}

impl ForecastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sites(sites: BTreeMap<String, SiteSeries>) -> Self {
        let mut store = Self { sites };
        // Snapshots written by other tools may be unsorted; normalise once.
        for series in store.sites.values_mut() {
            normalise(&mut series.forecasts);
        }
        store
    }

    /// Merge freshly fetched records into a site's series.
    ///
    /// Existing records with the same `period_start` are replaced, new ones
    /// inserted, the series re-sorted and everything whose date in `tz` is
    /// older than `HISTORY_DAYS` before today dropped. A record exactly on
    /// the boundary date is kept.
    pub fn merge(
        &mut self,
        site_id: &str,
        records: impl IntoIterator<Item = ForecastRecord>,
        tz: &Tz,
        now: DateTime<Utc>,
    ) -> MergeStats {
        let series = self.sites.entry(site_id.to_string()).or_default();

        let mut by_start: BTreeMap<DateTime<Utc>, ForecastRecord> = series
            .forecasts
            .iter()
            .map(|r| (r.period_start, *r))
            .collect();

        let mut stats = MergeStats::default();
        for record in records {
            match by_start.insert(record.period_start, record) {
                Some(_) => stats.replaced += 1,
                None => stats.inserted += 1,
            }
        }

        let cutoff = retention_start(tz, now);
        let before = by_start.len();
        by_start.retain(|start, _| *start >= cutoff);
        stats.pruned = before - by_start.len();

        series.forecasts = by_start.into_values().collect();
        stats.total = series.forecasts.len();

        debug!(
            site = site_id,
            inserted = stats.inserted,
            replaced = stats.replaced,
            pruned = stats.pruned,
            total = stats.total,
            "merged forecast records"
        );
        stats
    }

    /// Drop records older than the retention window from every site
    pub fn prune(&mut self, tz: &Tz, now: DateTime<Utc>) -> usize {
        let cutoff = retention_start(tz, now);
        let mut pruned = 0;
        for series in self.sites.values_mut() {
            let before = series.forecasts.len();
            series.forecasts.retain(|r| r.period_start >= cutoff);
            pruned += before - series.forecasts.len();
        }
        pruned
    }

    /// Keep only the listed sites, returning the ids that were dropped
    pub fn retain_sites(&mut self, site_ids: &HashSet<&str>) -> Vec<String> {
        let removed: Vec<String> = self
            .sites
            .keys()
            .filter(|id| !site_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in &removed {
            info!(site = %id, "rooftop site no longer configured, removing its history");
            self.sites.remove(id);
        }
        removed
    }

    pub fn site(&self, site_id: &str) -> Option<&SiteSeries> {
        self.sites.get(site_id)
    }

    pub fn contains(&self, site_id: &str) -> bool {
        self.sites.contains_key(site_id)
    }

    pub fn sites(&self) -> impl Iterator<Item = (&String, &SiteSeries)> {
        self.sites.iter()
    }

    pub fn site_ids(&self) -> impl Iterator<Item = &String> {
        self.sites.keys()
    }

    pub fn set_tally(&mut self, site_id: &str, tally: f64) {
        if let Some(series) = self.sites.get_mut(site_id) {
            series.tally = Some(tally);
        }
    }

    pub fn tally(&self, site_id: &str) -> Option<f64> {
        self.sites.get(site_id).and_then(|s| s.tally)
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn clear(&mut self) {
        self.sites.clear();
    }

    /// Owned copy of the site map, used when writing a snapshot
    pub fn to_sites(&self) -> BTreeMap<String, SiteSeries> {
        self.sites.clone()
    }
}

/// Local midnight opening the oldest day that survives pruning
pub fn retention_start(tz: &Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    local_midnight(tz, local_today(tz, now) - Duration::days(HISTORY_DAYS))
}

fn normalise(records: &mut Vec<ForecastRecord>) {
    let by_start: BTreeMap<DateTime<Utc>, ForecastRecord> =
        records.iter().map(|r| (r.period_start, *r)).collect();
    *records = by_start.into_values().collect();
}
