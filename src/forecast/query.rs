//! Read-only queries over the aggregate series.
//!
//! Every function here is pure: it borrows the series and a clock value and
//! never fails. An empty window yields zero energy or no peak.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::domain::{round4, EstimateField, ForecastRecord, PERIOD_SECONDS};
use crate::store::{AggregateSeries, FORECAST_DAYS};

/// Half-hour records in a complete day
pub const RECORDS_PER_DAY: usize = 48;

/// UTC instant of local midnight on `date`.
///
/// When DST skips midnight the day starts at the first valid local instant.
pub fn local_midnight(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Start of the current local hour, as a UTC instant
pub fn local_hour_start(tz: &Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(tz);
    now - Duration::seconds(i64::from(local.minute() * 60 + local.second()))
        - Duration::nanoseconds(i64::from(local.nanosecond()))
}

pub fn local_today(tz: &Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(tz).date_naive()
}

/// Sum of `field` over `[start, end)`, pro-rated for partial overlap.
///
/// The result is in stored units (kW averaged over half hours); callers
/// convert to energy.
pub fn energy_in_window(
    series: &AggregateSeries,
    field: EstimateField,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    let total: f64 = series
        .slice(start, end, false)
        .iter()
        .map(|r| r.value(field) * r.overlap_seconds(start, end) / PERIOD_SECONDS as f64)
        .sum();
    debug!(%start, %end, total, "energy in window");
    total
}

/// Record with the largest `field` value in `[start, end)`; the first wins ties
pub fn peak_in_window(
    series: &AggregateSeries,
    field: EstimateField,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<ForecastRecord> {
    series
        .slice(start, end, false)
        .iter()
        .fold(None, |best: Option<ForecastRecord>, r| match best {
            Some(b) if b.value(field) >= r.value(field) => Some(b),
            _ => Some(*r),
        })
}

/// A record with its start expressed in the installation's time zone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalRecord {
    pub period_start: DateTime<FixedOffset>,
    pub pv_estimate: f64,
    pub pv_estimate10: f64,
    pub pv_estimate90: f64,
}

impl LocalRecord {
    pub fn from_record(r: &ForecastRecord, tz: &Tz) -> Self {
        Self {
            period_start: r.period_start.with_timezone(tz).fixed_offset(),
            pv_estimate: r.estimate,
            pv_estimate10: r.estimate_low,
            pv_estimate90: r.estimate_high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    pub detailed_forecast: Vec<LocalRecord>,
    pub detailed_hourly: Vec<LocalRecord>,
    pub day_name: String,
    /// False when the day holds fewer than 48 half-hour records
    pub data_correct: bool,
}

/// Half-hourly and hourly records for local day `today + offset`
pub fn day_summary(series: &AggregateSeries, tz: &Tz, today: NaiveDate, offset: i64) -> DaySummary {
    let date = today + Duration::days(offset);
    let start = local_midnight(tz, date);
    let end = local_midnight(tz, date + Duration::days(1));

    let detailed: Vec<LocalRecord> = series
        .slice(start, end, offset < 0)
        .iter()
        .map(|r| LocalRecord::from_record(r, tz))
        .collect();

    let hourly = detailed
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => LocalRecord {
                period_start: a.period_start,
                pv_estimate: round4((a.pv_estimate + b.pv_estimate) / 2.0),
                pv_estimate10: round4((a.pv_estimate10 + b.pv_estimate10) / 2.0),
                pv_estimate90: round4((a.pv_estimate90 + b.pv_estimate90) / 2.0),
            },
            [a, ..] => LocalRecord {
                period_start: a.period_start,
                pv_estimate: round4(a.pv_estimate),
                pv_estimate10: round4(a.pv_estimate10),
                pv_estimate90: round4(a.pv_estimate90),
            },
            [] => unreachable!("chunks never yields an empty slice"),
        })
        .collect();

    DaySummary {
        data_correct: detailed.len() >= RECORDS_PER_DAY,
        detailed_forecast: detailed,
        detailed_hourly: hourly,
        day_name: start.with_timezone(tz).format("%A").to_string(),
    }
}

/// Wh per interval for energy dashboards.
///
/// Zero intervals are only emitted where they border production, so a
/// night of zeros collapses to its two edges.
pub fn energy_wh_hours(series: &AggregateSeries, field: EstimateField) -> BTreeMap<DateTime<Utc>, f64> {
    let records = series.records();
    let producing = |i: usize| records.get(i).is_some_and(|r| r.value(field) != 0.0);

    records
        .iter()
        .enumerate()
        .filter(|(i, r)| r.value(field) != 0.0 || (*i > 0 && producing(i - 1)) || producing(i + 1))
        .map(|(_, r)| (r.period_start, (r.value(field) * 500.0).round()))
        .collect()
}

/// Record count per local day for the forecast horizon, logged at debug
pub fn data_completeness(series: &AggregateSeries, tz: &Tz, today: NaiveDate) -> Vec<(NaiveDate, usize)> {
    (0..FORECAST_DAYS)
        .map(|n| {
            let date = today + Duration::days(n);
            let count = series
                .slice(local_midnight(tz, date), local_midnight(tz, date + Duration::days(1)), false)
                .len();
            if count >= RECORDS_PER_DAY {
                debug!(%date, "forecast day has all {RECORDS_PER_DAY} records");
            } else {
                debug!(%date, count, "forecast day is incomplete, derived values may be inaccurate");
            }
            (date, count)
        })
        .collect()
}

/// Sensor style values derived from the aggregate at one instant
#[derive(Debug, Clone, Copy)]
pub struct ForecastView<'a> {
    pub series: &'a AggregateSeries,
    pub field: EstimateField,
    pub tz: Tz,
    pub now: DateTime<Utc>,
}

impl<'a> ForecastView<'a> {
    pub fn new(series: &'a AggregateSeries, field: EstimateField, tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            series,
            field,
            tz,
            now,
        }
    }

    fn energy(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        energy_in_window(self.series, self.field, start, end)
    }

    fn day_start(&self, offset: i64) -> DateTime<Utc> {
        local_midnight(&self.tz, local_today(&self.tz, self.now) + Duration::days(offset))
    }

    fn day_window(&self, offset: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.day_start(offset), self.day_start(offset + 1))
    }

    /// Wh expected in local hour `now + n`
    pub fn forecast_n_hour(&self, n: i64) -> i64 {
        let start = local_hour_start(&self.tz, self.now) + Duration::hours(n);
        (500.0 * self.energy(start, start + Duration::hours(1))).round() as i64
    }

    /// Wh expected over the next `hours`
    pub fn forecast_custom_hours(&self, hours: u32) -> i64 {
        let end = self.now + Duration::hours(i64::from(hours));
        (500.0 * self.energy(self.now, end)).round() as i64
    }

    /// W expected `minutes` from now, smoothed over a 20 minute window
    pub fn power_in_n_minutes(&self, minutes: i64) -> i64 {
        let start = self.now + Duration::minutes(minutes - 10);
        (1000.0 * 1.5 * self.energy(start, start + Duration::minutes(20))).round() as i64
    }

    pub fn peak_w_day(&self, offset: i64) -> i64 {
        let (start, end) = self.day_window(offset);
        peak_in_window(self.series, self.field, start, end)
            .map(|r| (1000.0 * r.value(self.field)).round() as i64)
            .unwrap_or(0)
    }

    pub fn peak_time_day(&self, offset: i64) -> Option<DateTime<FixedOffset>> {
        let (start, end) = self.day_window(offset);
        peak_in_window(self.series, self.field, start, end)
            .map(|r| r.period_start.with_timezone(&self.tz).fixed_offset())
    }

    /// kWh still expected before local midnight
    pub fn remaining_today(&self) -> f64 {
        0.5 * self.energy(self.now, self.day_start(1))
    }

    pub fn total_kwh_day(&self, offset: i64) -> f64 {
        let (start, end) = self.day_window(offset);
        0.5 * self.energy(start, end)
    }

    pub fn sensors(&self, custom_hours: u32) -> SensorValues {
        SensorValues {
            total_kwh_today: self.total_kwh_day(0),
            total_kwh_tomorrow: self.total_kwh_day(1),
            total_kwh_days: (2..7).map(|n| self.total_kwh_day(n)).collect(),
            forecast_this_hour: self.forecast_n_hour(0),
            forecast_next_hour: self.forecast_n_hour(1),
            forecast_custom_hours: self.forecast_custom_hours(custom_hours),
            custom_hours,
            remaining_today: self.remaining_today(),
            power_now: self.power_in_n_minutes(0),
            power_in_30_minutes: self.power_in_n_minutes(30),
            power_in_1_hour: self.power_in_n_minutes(60),
            peak_w_today: self.peak_w_day(0),
            peak_time_today: self.peak_time_day(0),
            peak_w_tomorrow: self.peak_w_day(1),
            peak_time_tomorrow: self.peak_time_day(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorValues {
    pub total_kwh_today: f64,
    pub total_kwh_tomorrow: f64,
    /// Day 3 through day 7
    pub total_kwh_days: Vec<f64>,
    pub forecast_this_hour: i64,
    pub forecast_next_hour: i64,
    pub forecast_custom_hours: i64,
    pub custom_hours: u32,
    pub remaining_today: f64,
    pub power_now: i64,
    pub power_in_30_minutes: i64,
    pub power_in_1_hour: i64,
    pub peak_w_today: i64,
    pub peak_time_today: Option<DateTime<FixedOffset>>,
    pub peak_w_tomorrow: i64,
    pub peak_time_tomorrow: Option<DateTime<FixedOffset>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    /// Flat day of 48 records for 2024-03-01 UTC with a midday bump
    fn flat_day() -> AggregateSeries {
        let base = utc(2024, 3, 1, 0, 0);
        let records = (0..48)
            .map(|i| {
                let v = if i == 24 { 5.0 } else { 2.0 };
                ForecastRecord::new(base + Duration::minutes(30 * i), v, v / 2.0, v * 2.0)
            })
            .collect();
        AggregateSeries::new(records, base)
    }

    #[test]
    fn test_energy_pro_rates_partial_record() {
        let base = utc(2024, 1, 1, 2, 0);
        let series = AggregateSeries::new(vec![ForecastRecord::new(base, 100.0, 0.0, 0.0)], base);
        let e = energy_in_window(&series, EstimateField::Estimate, base + Duration::minutes(10), base + Duration::hours(1));
        assert_relative_eq!(e, 100.0 * 1200.0 / 1800.0);
    }

    #[test]
    fn test_energy_uses_selected_field() {
        let series = flat_day();
        let start = utc(2024, 3, 1, 0, 0);
        let end = start + Duration::hours(1);
        assert_relative_eq!(energy_in_window(&series, EstimateField::Estimate, start, end), 4.0);
        assert_relative_eq!(energy_in_window(&series, EstimateField::Estimate90, start, end), 8.0);
    }

    #[test]
    fn test_peak_in_window() {
        let series = flat_day();
        let peak = peak_in_window(&series, EstimateField::Estimate, utc(2024, 3, 1, 0, 0), utc(2024, 3, 2, 0, 0)).unwrap();
        assert_eq!(peak.period_start, utc(2024, 3, 1, 12, 0));
        assert!(peak_in_window(&series, EstimateField::Estimate, utc(2024, 3, 5, 0, 0), utc(2024, 3, 6, 0, 0)).is_none());
    }

    #[test]
    fn test_day_summary_full_day() {
        let series = flat_day();
        let summary = day_summary(&series, &Tz::UTC, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), 0);
        assert_eq!(summary.detailed_forecast.len(), 48);
        assert_eq!(summary.detailed_hourly.len(), 24);
        assert_eq!(summary.day_name, "Friday");
        assert!(summary.data_correct);
        assert_relative_eq!(summary.detailed_hourly[12].pv_estimate, 3.5);
    }

    #[test]
    fn test_day_summary_partial_day_odd_tail() {
        let base = utc(2024, 3, 1, 0, 0);
        let records = (0..3)
            .map(|i| ForecastRecord::new(base + Duration::minutes(30 * i), 1.0 + i as f64, 0.0, 0.0))
            .collect();
        let series = AggregateSeries::new(records, base);
        let summary = day_summary(&series, &Tz::UTC, base.date_naive(), 0);
        assert!(!summary.data_correct);
        assert_eq!(summary.detailed_hourly.len(), 2);
        assert_relative_eq!(summary.detailed_hourly[0].pv_estimate, 1.5);
        assert_relative_eq!(summary.detailed_hourly[1].pv_estimate, 3.0);
    }

    #[test]
    fn test_local_midnight_respects_zone() {
        let tz: Tz = "Australia/Sydney".parse().unwrap();
        let midnight = local_midnight(&tz, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(midnight, utc(2024, 5, 31, 14, 0));
    }

    #[test]
    fn test_local_hour_start_half_hour_offset() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let now = utc(2024, 6, 1, 6, 45);
        assert_eq!(local_hour_start(&tz, now), utc(2024, 6, 1, 6, 30));
    }

    #[test]
    fn test_energy_wh_hours_keeps_edges_only() {
        let base = utc(2024, 3, 1, 0, 0);
        let values = [0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0];
        let records = values
            .iter()
            .enumerate()
            .map(|(i, v)| ForecastRecord::new(base + Duration::minutes(30 * i as i64), *v, 0.0, 0.0))
            .collect();
        let series = AggregateSeries::new(records, base);
        let wh = energy_wh_hours(&series, EstimateField::Estimate);
        let keys: Vec<_> = wh.keys().map(|k| (*k - base).num_minutes() / 30).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
        assert_eq!(wh[&(base + Duration::minutes(90))], 1000.0);
    }

    #[test]
    fn test_view_sensors() {
        let series = flat_day();
        let now = utc(2024, 3, 1, 12, 0);
        let view = ForecastView::new(&series, EstimateField::Estimate, Tz::UTC, now);
        assert_eq!(view.forecast_n_hour(0), 3500);
        assert_eq!(view.peak_w_day(0), 5000);
        assert_eq!(view.peak_w_day(1), 0);
        // 10 minutes of 2.0 and 10 minutes of 5.0, scaled up to a full half hour
        assert_eq!(view.power_in_n_minutes(0), 3500);
        assert_relative_eq!(view.total_kwh_day(0), 0.5 * (47.0 * 2.0 + 5.0));
        assert_relative_eq!(view.remaining_today(), 0.5 * (23.0 * 2.0 + 5.0));
        assert!(view.sensors(3).peak_time_today.is_some());
    }
}
