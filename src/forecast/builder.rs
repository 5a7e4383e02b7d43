use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::info;

use super::{local_midnight, local_today, DampeningTable, HardLimit};
use crate::domain::{round4, EstimateField, ForecastRecord};
use crate::store::{retention_start, AggregateSeries, ForecastStore, FORECAST_DAYS};

/// Everything a rebuild reads besides the store itself
#[derive(Debug, Clone)]
pub struct Transform<'a> {
    pub dampening: &'a DampeningTable,
    pub hard_limit: &'a HardLimit,
    /// Position of each site's API key in configured key order
    pub credential_index: &'a HashMap<String, usize>,
    pub field: EstimateField,
    pub tz: Tz,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rebuilt {
    pub aggregate: AggregateSeries,
    /// Same merge without dampening; the hard limit still applies
    pub undampened: AggregateSeries,
}

/// Prune the store, then recompute both aggregates and every site tally.
///
/// Records whose local date lies within `HISTORY_DAYS` back and before
/// `FORECAST_DAYS` ahead are summed across sites. The running sum for an
/// interval is rounded and clamped after each site is added, using the
/// limit of that site's API key, so with several keys the order matters.
pub fn rebuild(store: &mut ForecastStore, transform: &Transform<'_>, now: DateTime<Utc>) -> Rebuilt {
    let started = Instant::now();
    store.prune(&transform.tz, now);

    let (aggregate, tallies) = accumulate(store, transform, now, |site, hour, minute| {
        transform.dampening.factor_for(site, hour, minute)
    });
    let (undampened, _) = accumulate(store, transform, now, |_, _, _| 1.0);

    for (site, tally) in tallies {
        store.set_tally(&site, tally);
    }

    let day_start = local_midnight(&transform.tz, local_today(&transform.tz, now));
    let rebuilt = Rebuilt {
        aggregate: AggregateSeries::new(aggregate, day_start),
        undampened: AggregateSeries::new(undampened, day_start),
    };

    info!(
        records = rebuilt.aggregate.len(),
        sites = store.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rebuilt aggregate forecast"
    );
    rebuilt
}

fn accumulate(
    store: &ForecastStore,
    transform: &Transform<'_>,
    now: DateTime<Utc>,
    factor: impl Fn(&str, u32, u32) -> f64,
) -> (Vec<ForecastRecord>, BTreeMap<String, f64>) {
    let today = local_today(&transform.tz, now);
    let oldest = retention_start(&transform.tz, now);
    let last = today + Duration::days(FORECAST_DAYS);

    let mut sums: BTreeMap<DateTime<Utc>, ForecastRecord> = BTreeMap::new();
    let mut tallies = BTreeMap::new();

    for (site, series) in store.sites() {
        let credential = transform.credential_index.get(site).copied().unwrap_or(0);
        let limit = transform.hard_limit.for_credential(credential);
        let mut tally = 0.0;

        for record in &series.forecasts {
            let local = record.period_start.with_timezone(&transform.tz);
            let date = local.date_naive();
            if record.period_start < oldest || date >= last {
                continue;
            }

            let f = factor(site, local.hour(), local.minute());
            if date == today {
                tally += (record.value(transform.field) * 0.5 * f).min(limit);
            }

            sums.entry(record.period_start)
                .and_modify(|sum| {
                    sum.estimate = round4(sum.estimate + record.estimate * f).min(limit);
                    sum.estimate_low = round4(sum.estimate_low + record.estimate_low * f).min(limit);
                    sum.estimate_high = round4(sum.estimate_high + record.estimate_high * f).min(limit);
                })
                .or_insert_with(|| {
                    ForecastRecord::new(
                        record.period_start,
                        round4(record.estimate * f).min(limit),
                        round4(record.estimate_low * f).min(limit),
                        round4(record.estimate_high * f).min(limit),
                    )
                });
        }

        tallies.insert(site.clone(), round4(tally));
    }

    (sums.into_values().collect(), tallies)
}
