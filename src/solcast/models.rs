use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::FetchError;
use crate::domain::{period, ForecastRecord, Site};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitesResponse {
    #[serde(default)]
    pub sites: Vec<Site>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawForecast {
    pub period_end: DateTime<FixedOffset>,
    pub pv_estimate: f64,
    #[serde(default)]
    pub pv_estimate10: f64,
    #[serde(default)]
    pub pv_estimate90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastsResponse {
    pub forecasts: Vec<RawForecast>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawActual {
    pub period_end: DateTime<FixedOffset>,
    pub pv_estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualsResponse {
    pub estimated_actuals: Vec<RawActual>,
}

/// Interval start for a reported `period_end`, seconds truncated.
///
/// The result must sit on a half-hour boundary.
pub fn period_start_from_end(period_end: DateTime<FixedOffset>) -> Result<DateTime<Utc>, FetchError> {
    let end = period_end.with_timezone(&Utc);
    let truncated = end
        - Duration::seconds(i64::from(end.second()))
        - Duration::nanoseconds(i64::from(end.nanosecond()));
    let start = truncated - period();
    if start.minute() != 0 && start.minute() != 30 {
        return Err(FetchError::Malformed(format!(
            "period_start minute is not 0 or 30: {start}"
        )));
    }
    Ok(start)
}

impl ForecastsResponse {
    /// Records starting before `horizon`
    pub fn into_records(self, horizon: DateTime<Utc>) -> Result<Vec<ForecastRecord>, FetchError> {
        let mut records = Vec::with_capacity(self.forecasts.len());
        for raw in self.forecasts {
            let start = period_start_from_end(raw.period_end)?;
            if start < horizon {
                records.push(ForecastRecord::new(
                    start,
                    raw.pv_estimate,
                    raw.pv_estimate10,
                    raw.pv_estimate90,
                ));
            }
        }
        Ok(records)
    }
}

impl ActualsResponse {
    /// Records starting after `oldest`; actuals carry no percentiles
    pub fn into_records(self, oldest: DateTime<Utc>) -> Result<Vec<ForecastRecord>, FetchError> {
        let mut records = Vec::with_capacity(self.estimated_actuals.len());
        for raw in self.estimated_actuals {
            let start = period_start_from_end(raw.period_end)?;
            if start > oldest {
                records.push(ForecastRecord::new(start, raw.pv_estimate, 0.0, 0.0));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parses_seven_digit_fractions() {
        let body = r#"{"forecasts":[
            {"period_end":"2024-01-01T02:30:00.0000000Z","pv_estimate":4.5,"pv_estimate10":3.1,"pv_estimate90":5.2,"period":"PT30M"}
        ]}"#;
        let resp: ForecastsResponse = serde_json::from_str(body).unwrap();
        let horizon = Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap();
        let records = resp.into_records(horizon).unwrap();
        assert_eq!(records[0].period_start, Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());
        assert_eq!(records[0].estimate_high, 5.2);
    }

    #[test]
    fn test_offset_timestamps_convert_to_utc() {
        let end = DateTime::parse_from_rfc3339("2024-01-01T12:00:00+10:00").unwrap();
        assert_eq!(
            period_start_from_end(end).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_seconds_are_truncated() {
        let end = DateTime::parse_from_rfc3339("2024-01-01T02:30:59Z").unwrap();
        assert_eq!(
            period_start_from_end(end).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_misaligned_period_is_malformed() {
        let end = DateTime::parse_from_rfc3339("2024-01-01T02:15:00Z").unwrap();
        assert!(matches!(period_start_from_end(end), Err(FetchError::Malformed(_))));
    }

    #[test]
    fn test_horizon_and_oldest_filters() {
        let t = |h, m| Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap().fixed_offset();
        let forecasts = ForecastsResponse {
            forecasts: vec![
                RawForecast { period_end: t(1, 0), pv_estimate: 1.0, pv_estimate10: 0.0, pv_estimate90: 0.0 },
                RawForecast { period_end: t(1, 30), pv_estimate: 1.0, pv_estimate10: 0.0, pv_estimate90: 0.0 },
            ],
        };
        let horizon = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        assert_eq!(forecasts.into_records(horizon).unwrap().len(), 1);

        let actuals = ActualsResponse {
            estimated_actuals: vec![
                RawActual { period_end: t(1, 0), pv_estimate: 2.0 },
                RawActual { period_end: t(1, 30), pv_estimate: 3.0 },
            ],
        };
        let oldest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let records = actuals.into_records(oldest).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].estimate, 3.0);
        assert_eq!(records[0].estimate_low, 0.0);
    }
}
