use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Length of one forecast interval in seconds
pub const PERIOD_SECONDS: i64 = 1800;

/// Length of one forecast interval
pub fn period() -> Duration {
    Duration::seconds(PERIOD_SECONDS)
}

/// One half-hour forecast interval `[period_start, period_start + 30min)`.
///
/// Values are average power in kW over the interval. The serialized field
/// names follow the remote API and the snapshot file format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub period_start: DateTime<Utc>,
    #[serde(rename = "pv_estimate")]
    pub estimate: f64,
    #[serde(rename = "pv_estimate10", default)]
    pub estimate_low: f64,
    #[serde(rename = "pv_estimate90", default)]
    pub estimate_high: f64,
}

impl ForecastRecord {
    pub fn new(period_start: DateTime<Utc>, estimate: f64, estimate_low: f64, estimate_high: f64) -> Self {
        Self {
            period_start,
            estimate,
            estimate_low,
            estimate_high,
        }
    }

    /// End of the interval (exclusive)
    pub fn period_end(&self) -> DateTime<Utc> {
        self.period_start + period()
    }

    /// Value of the selected estimate field
    pub fn value(&self, field: EstimateField) -> f64 {
        match field {
            EstimateField::Estimate => self.estimate,
            EstimateField::Estimate10 => self.estimate_low,
            EstimateField::Estimate90 => self.estimate_high,
        }
    }

    /// Whether the interval overlaps the half-open window `[start, end)`
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.period_end() && end > self.period_start
    }

    /// Seconds of this interval covered by `[start, end)`, in `0..=1800`
    pub fn overlap_seconds(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        let mut seconds = PERIOD_SECONDS as f64;
        if start > self.period_start {
            seconds -= (start - self.period_start).num_milliseconds() as f64 / 1000.0;
        }
        if end < self.period_end() {
            seconds -= (self.period_end() - end).num_milliseconds() as f64 / 1000.0;
        }
        seconds.clamp(0.0, PERIOD_SECONDS as f64)
    }
}

/// Whether a timestamp sits on a half-hour boundary
pub fn is_period_aligned(ts: DateTime<Utc>) -> bool {
    (ts.minute() == 0 || ts.minute() == 30) && ts.second() == 0 && ts.nanosecond() == 0
}

/// Which of the three forecast values drives sums, peaks and sensors
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EstimateField {
    /// Central (50th percentile) estimate
    #[default]
    Estimate,
    /// 10th percentile estimate
    Estimate10,
    /// 90th percentile estimate
    Estimate90,
}

/// Round to four decimal places, the precision kept in the aggregate series
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_overlap_full_and_partial() {
        let r = ForecastRecord::new(at(2, 0), 100.0, 80.0, 120.0);
        assert_eq!(r.overlap_seconds(at(1, 0), at(3, 0)), 1800.0);
        assert_eq!(r.overlap_seconds(at(2, 10), at(3, 0)), 1200.0);
        assert_eq!(r.overlap_seconds(at(2, 10), at(2, 20)), 600.0);
    }

    #[test]
    fn test_intersects_is_half_open() {
        let r = ForecastRecord::new(at(2, 0), 1.0, 1.0, 1.0);
        assert!(!r.intersects(at(2, 30), at(3, 0)));
        assert!(!r.intersects(at(1, 30), at(2, 0)));
        assert!(r.intersects(at(2, 29), at(2, 31)));
    }

    #[test]
    fn test_alignment() {
        assert!(is_period_aligned(at(5, 30)));
        assert!(is_period_aligned(at(5, 0)));
        assert!(!is_period_aligned(at(5, 15)));
    }

    #[test]
    fn test_estimate_field_names() {
        assert_eq!(EstimateField::Estimate90.to_string(), "estimate90");
        assert_eq!("estimate10".parse::<EstimateField>().unwrap(), EstimateField::Estimate10);
        assert!("median".parse::<EstimateField>().is_err());
    }

    #[test]
    fn test_record_serializes_with_api_field_names() {
        let r = ForecastRecord::new(at(2, 0), 4.5, 3.0, 5.25);
        let json = serde_json::to_value(r).unwrap();
        assert_eq!(json["pv_estimate"], 4.5);
        assert_eq!(json["pv_estimate10"], 3.0);
        assert_eq!(json["pv_estimate90"], 5.25);
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(1.234_56), 1.2346);
        assert_eq!(round4(7200.0), 7200.0);
    }
}
