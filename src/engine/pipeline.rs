use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, error, info, warn};

use super::{CycleReport, SitesStatus, SolcastEngine, UpdatePhase};
use crate::domain::{redact_api_key, ForecastRecord, Site};
use crate::forecast::{data_completeness, local_midnight, local_today, rebuild, Transform};
use crate::solcast::{FetchError, SitesResponse};
use crate::storage::{CachedCall, Snapshot};
use crate::store::FORECAST_DAYS;

/// Estimated actuals requested for a backfill
pub const ACTUALS_HOURS: i64 = 168;

/// Backfilled actuals are kept from this many days before local midnight
pub const ACTUALS_DAYS: i64 = 6;

enum SiteFetch {
    Records {
        records: Vec<ForecastRecord>,
        from_cache: bool,
    },
    QuotaSkipped,
}

impl SolcastEngine {
    async fn set_phase(&self, phase: UpdatePhase) {
        self.state.write().await.phase = phase;
        debug!(%phase, "update phase");
    }

    /// Sites for every key, falling back to each key's cached list
    pub(super) async fn fetch_sites(&self) -> Result<Vec<Site>, SitesStatus> {
        self.set_phase(UpdatePhase::FetchingSites).await;
        let mut sites = Vec::new();

        for key in &self.api_keys {
            let call = CachedCall::Sites { api_key: key };
            match self.source.rooftop_sites(key).await {
                Ok(resp) => {
                    self.cache.store(call, &resp).await;
                    sites.extend(resp.sites);
                }
                Err(e) => {
                    warn!(key = %redact_api_key(key), error = %e, "rooftop sites unavailable, trying cache");
                    match self.cache.load::<SitesResponse>(call).await {
                        Ok(Some(cached)) => {
                            info!(what = %self.cache.describe(call), sites = cached.sites.len(), "using cached rooftop sites");
                            sites.extend(cached.sites.into_iter().map(|mut site| {
                                site.api_key = key.clone();
                                site
                            }));
                        }
                        Ok(None) => {
                            error!(key = %redact_api_key(key), "no cached rooftop sites");
                            self.set_phase(UpdatePhase::Idle).await;
                            return Err(SitesStatus::Error);
                        }
                        Err(e) => {
                            error!(key = %redact_api_key(key), error = %e, "cached rooftop sites unreadable");
                            self.set_phase(UpdatePhase::Idle).await;
                            return Err(SitesStatus::Error);
                        }
                    }
                }
            }
        }

        if sites.is_empty() {
            error!("no rooftop sites found for any API key");
            self.set_phase(UpdatePhase::Idle).await;
            return Err(SitesStatus::NoSites);
        }
        for site in &sites {
            debug!(site = %site.resource_id, key = %redact_api_key(&site.api_key), "rooftop site");
        }
        Ok(sites)
    }

    /// Usage per key, from the API or else the usage file
    pub(super) async fn fetch_usage(&self) {
        self.set_phase(UpdatePhase::FetchingUsage).await;
        for key in &self.api_keys {
            let fetched = self.source.usage(key).await;
            let mut quota = self.quota.lock().await;
            match fetched {
                Ok(q) => quota.set(key, q).await,
                Err(e) => {
                    warn!(key = %redact_api_key(key), error = %e, "API usage unavailable");
                    quota.restore(key).await;
                }
            }
        }
        self.set_phase(UpdatePhase::Idle).await;
    }

    /// Fetch, merge, rebuild and persist for `sites`.
    ///
    /// Sites are fetched one after another and merged as soon as they
    /// arrive, so a failure part way keeps earlier sites. `last_updated`
    /// only moves when `bump` is set and no site failed.
    pub(super) async fn run_cycle(&self, sites: &[Site], backfill: bool, bump: bool) -> CycleReport {
        let now = self.now();
        self.state.write().await.last_attempt = Some(now);
        info!(sites = sites.len(), backfill, "forecast update started");

        let mut report = CycleReport::default();
        for site in sites {
            self.set_phase(UpdatePhase::FetchingForecasts).await;
            let id = site.resource_id.clone();
            match self.fetch_site(site, backfill, now).await {
                Ok(SiteFetch::Records {
                    records,
                    from_cache,
                }) => {
                    let mut state = self.state.write().await;
                    state.phase = UpdatePhase::Merging;
                    state.store.merge(&id, records, &self.tz, now);
                    if from_cache {
                        report.from_cache.push(id.clone());
                    }
                    report.updated.push(id);
                }
                Ok(SiteFetch::QuotaSkipped) => report.quota_skipped.push(id),
                Err(e) => {
                    error!(site = %id, error = %e, "forecast fetch failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        report.success = report.failed.is_empty() && !report.updated.is_empty();
        if report.success && bump {
            self.state.write().await.last_updated = now;
            self.snapshots.mark_ready();
        }

        self.rebuild_and_persist(now).await;

        if report.success {
            info!(
                updated = report.updated.len(),
                cached = report.from_cache.len(),
                skipped = report.quota_skipped.len(),
                "forecast update completed"
            );
        } else {
            warn!(
                updated = report.updated.len(),
                skipped = report.quota_skipped.len(),
                failed = report.failed.len(),
                "forecast update did not complete"
            );
        }
        report
    }

    async fn fetch_site(&self, site: &Site, backfill: bool, now: DateTime<Utc>) -> Result<SiteFetch, FetchError> {
        let key = site.api_key.as_str();
        let id = site.resource_id.as_str();
        let today = local_today(&self.tz, now);
        let mut records = Vec::new();
        let mut from_cache = false;

        if backfill {
            if !self.quota.lock().await.can_call(key) {
                warn!(site = id, key = %redact_api_key(key), "API quota exhausted, skipping site");
                return Ok(SiteFetch::QuotaSkipped);
            }
            let oldest = local_midnight(&self.tz, today - Duration::days(ACTUALS_DAYS));
            let (actuals, cached) = self
                .call_cached(
                    CachedCall::Actuals { site_id: id },
                    key,
                    self.source.estimated_actuals(id, key, ACTUALS_HOURS),
                    |resp| resp.into_records(oldest),
                )
                .await?;
            from_cache |= cached;
            records.extend(actuals);
        }

        if !self.quota.lock().await.can_call(key) {
            warn!(site = id, key = %redact_api_key(key), "API quota exhausted, skipping site");
            if records.is_empty() {
                return Ok(SiteFetch::QuotaSkipped);
            }
            return Ok(SiteFetch::Records {
                records,
                from_cache,
            });
        }

        let last_day = local_midnight(&self.tz, today + Duration::days(FORECAST_DAYS));
        let hours = forecast_hours(now, last_day);
        let (forecasts, cached) = self
            .call_cached(
                CachedCall::Forecasts { site_id: id },
                key,
                self.source.forecasts(id, key, hours),
                |resp| resp.into_records(last_day),
            )
            .await?;
        from_cache |= cached;
        records.extend(forecasts);

        debug!(site = id, records = records.len(), hours, from_cache, "site fetched");
        Ok(SiteFetch::Records {
            records,
            from_cache,
        })
    }

    /// Run `request` and `convert` its body, counting the call against the key.
    ///
    /// Only a body that converts cleanly replaces the cached one. Failures
    /// that allow it fall back to the cached body, which is not counted. The
    /// flag is true when the cache was used.
    async fn call_cached<T, R, F>(
        &self,
        call: CachedCall<'_>,
        key: &str,
        request: F,
        convert: impl Fn(T) -> Result<R, FetchError>,
    ) -> Result<(R, bool), FetchError>
    where
        T: Clone + Serialize + DeserializeOwned,
        F: Future<Output = Result<T, FetchError>>,
    {
        match request.await {
            Ok(body) => {
                self.quota.lock().await.record_call(key).await;
                let converted = convert(body.clone())?;
                self.cache.store(call, &body).await;
                Ok((converted, false))
            }
            Err(e) if e.allows_cache_fallback() => match self.cache.load::<T>(call).await {
                Ok(Some(body)) => {
                    warn!(what = %self.cache.describe(call), error = %e, "API unavailable, using cached response");
                    Ok((convert(body)?, true))
                }
                Ok(None) => Err(e),
                Err(io) => {
                    warn!(what = %self.cache.describe(call), error = %io, "cached response unreadable");
                    Err(e)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Rebuild aggregates from the store and write the snapshot
    pub(super) async fn rebuild_and_persist(&self, now: DateTime<Utc>) {
        let snapshot = {
            let mut guard = self.state.write().await;
            guard.phase = UpdatePhase::Rebuilding;
            let state = &mut *guard;

            let credential_index = self.credential_index(&state.sites);
            let transform = Transform {
                dampening: &state.options.dampening,
                hard_limit: &state.options.hard_limit,
                credential_index: &credential_index,
                field: state.options.key_estimate,
                tz: self.tz,
            };
            state.rebuilt = rebuild(&mut state.store, &transform, now);
            data_completeness(&state.rebuilt.aggregate, &self.tz, local_today(&self.tz, now));

            state.phase = UpdatePhase::Persisting;
            let mut snapshot = Snapshot::new(state.store.to_sites(), state.last_updated);
            snapshot.last_attempt = state.last_attempt;
            snapshot
        };

        match self.snapshots.save(&snapshot).await {
            Ok(true) => debug!("snapshot written"),
            Ok(false) => debug!("snapshot not written, no data yet"),
            Err(e) => error!(error = %e, "failed to write snapshot"),
        }
        self.set_phase(UpdatePhase::Idle).await;
    }
}

/// Whole hours from `now` until `last_day`, rounded up
pub fn forecast_hours(now: DateTime<Utc>, last_day: DateTime<Utc>) -> i64 {
    let seconds = (last_day - now).num_seconds().max(0);
    (seconds + 3599) / 3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_forecast_hours_rounds_up() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 20, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap();
        assert_eq!(forecast_hours(now, end), 182);
        assert_eq!(forecast_hours(end, end), 0);
        assert_eq!(forecast_hours(end, now), 0);
    }
}
