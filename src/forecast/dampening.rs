use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ValidationError;

pub const HOURLY_FACTORS: usize = 24;
pub const HALF_HOURLY_FACTORS: usize = 48;

/// Granular entry applied to every site without its own factors
pub const ALL_SITES: &str = "all";

/// Validated dampening factors: 24 hourly or 48 half-hourly values in `[0, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Factors(Vec<f64>);

impl Factors {
    pub fn new(values: Vec<f64>) -> Result<Self, ValidationError> {
        if values.is_empty() {
            return Err(ValidationError::NoFactors);
        }
        if values.len() != HOURLY_FACTORS && values.len() != HALF_HOURLY_FACTORS {
            return Err(ValidationError::WrongFactorCount(values.len()));
        }
        if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(ValidationError::FactorOutOfRange(*bad));
        }
        Ok(Self(values))
    }

    /// Parse a comma separated list such as `"1,1,0.9,..."`
    pub fn parse(csv: &str) -> Result<Self, ValidationError> {
        let csv = csv.trim();
        if csv.is_empty() {
            return Err(ValidationError::NoFactors);
        }
        let values = csv
            .split(',')
            .map(|v| {
                let v = v.trim();
                v.parse::<f64>()
                    .map_err(|_| ValidationError::Unparsable(v.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(values)
    }

    pub fn ones() -> Self {
        Self(vec![1.0; HOURLY_FACTORS])
    }

    pub fn is_half_hourly(&self) -> bool {
        self.0.len() == HALF_HOURLY_FACTORS
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    /// Factor for a local wall-clock time
    pub fn at(&self, hour: u32, minute: u32) -> f64 {
        let idx = if self.is_half_hourly() {
            hour as usize * 2 + (minute / 30) as usize
        } else {
            hour as usize
        };
        self.0.get(idx).copied().unwrap_or(1.0)
    }
}

impl TryFrom<Vec<f64>> for Factors {
    type Error = ValidationError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Factors> for Vec<f64> {
    fn from(f: Factors) -> Self {
        f.0
    }
}

impl fmt::Display for Factors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

/// Active dampening configuration. Exactly one mode is in force.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DampeningTable {
    /// One hourly table shared by every site
    Uniform { factors: [f64; HOURLY_FACTORS] },
    /// Per-site tables, with an optional `all` fallback
    PerSiteGranular { sites: BTreeMap<String, Factors> },
}

impl Default for DampeningTable {
    fn default() -> Self {
        Self::uniform(1.0)
    }
}

/// What `get_dampening` hands back to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DampeningView {
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub factors: Vec<f64>,
}

impl DampeningTable {
    pub fn uniform(factor: f64) -> Self {
        Self::Uniform {
            factors: [factor; HOURLY_FACTORS],
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Uniform { .. } => "uniform",
            Self::PerSiteGranular { .. } => "per_site_granular",
        }
    }

    /// Factor for a record of `site` at local `hour:minute`.
    ///
    /// Granular lookup tries the site's own table, then `all`, then 1.0.
    pub fn factor_for(&self, site: &str, hour: u32, minute: u32) -> f64 {
        match self {
            Self::Uniform { factors } => factors.get(hour as usize).copied().unwrap_or(1.0),
            Self::PerSiteGranular { sites } => sites
                .get(site)
                .or_else(|| sites.get(ALL_SITES))
                .map(|f| f.at(hour, minute))
                .unwrap_or(1.0),
        }
    }

    /// Produce the table that results from a host `set_dampening` call.
    ///
    /// `self` is left untouched; the caller swaps in the returned table only
    /// when it is `Ok`.
    pub fn with_factors<S: AsRef<str>>(
        &self,
        csv: &str,
        site: Option<&str>,
        known_sites: &[S],
    ) -> Result<Self, ValidationError> {
        let factors = Factors::parse(csv)?;

        match site.map(str::trim).filter(|s| !s.is_empty()) {
            None if !factors.is_half_hourly() => {
                let mut hourly = [1.0; HOURLY_FACTORS];
                hourly.copy_from_slice(factors.values());
                Ok(Self::Uniform { factors: hourly })
            }
            None => Ok(self.with_granular_entry(ALL_SITES, factors)),
            Some(ALL_SITES) if !factors.is_half_hourly() => {
                Err(ValidationError::AllRequiresHalfHourly)
            }
            Some(ALL_SITES) => Ok(self.with_granular_entry(ALL_SITES, factors)),
            Some(site) => {
                if !known_sites.iter().any(|s| s.as_ref() == site) {
                    return Err(ValidationError::UnknownSite(site.to_string()));
                }
                Ok(self.with_granular_entry(site, factors))
            }
        }
    }

    fn with_granular_entry(&self, site: &str, factors: Factors) -> Self {
        let mut sites = match self {
            Self::PerSiteGranular { sites } => sites.clone(),
            Self::Uniform { .. } => BTreeMap::new(),
        };
        sites.insert(site.to_string(), factors);
        Self::PerSiteGranular { sites }
    }

    /// Active factors for `site`, or for the table as a whole
    pub fn view(&self, site: Option<&str>) -> DampeningView {
        match self {
            Self::Uniform { factors } => DampeningView {
                mode: self.mode(),
                site: None,
                factors: factors.to_vec(),
            },
            Self::PerSiteGranular { sites } => {
                let (key, factors) = site
                    .and_then(|s| sites.get_key_value(s))
                    .or_else(|| sites.get_key_value(ALL_SITES))
                    .map(|(k, f)| (k.clone(), f.values().to_vec()))
                    .unwrap_or_else(|| (ALL_SITES.to_string(), Factors::ones().values().to_vec()));
                DampeningView {
                    mode: self.mode(),
                    site: Some(key),
                    factors,
                }
            }
        }
    }
}

/// Ceiling in kW for a running aggregate, one value per API key.
///
/// Empty means unlimited. A single value applies to every key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardLimit(Vec<f64>);

impl HardLimit {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn single(kw: f64) -> Result<Self, ValidationError> {
        Ok(Self(vec![Self::validate(kw)?]))
    }

    /// Parse `"5.5"` or `"5.5,3"` for `credentials` API keys
    pub fn parse(csv: &str, credentials: usize) -> Result<Self, ValidationError> {
        let values = csv
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                let kw = v
                    .parse::<f64>()
                    .map_err(|_| ValidationError::Unparsable(v.to_string()))?;
                Self::validate(kw)
            })
            .collect::<Result<Vec<_>, _>>()?;

        if values.is_empty() {
            return Err(ValidationError::Unparsable(csv.to_string()));
        }
        if values.len() > credentials.max(1) {
            return Err(ValidationError::TooManyHardLimits {
                given: values.len(),
                credentials,
            });
        }
        Ok(Self(values))
    }

    /// Round to 0.1 kW, then require what is left to be positive
    fn validate(kw: f64) -> Result<f64, ValidationError> {
        let rounded = (kw * 10.0).round() / 10.0;
        if !rounded.is_finite() || rounded <= 0.0 {
            return Err(ValidationError::HardLimitNotPositive(kw));
        }
        Ok(rounded)
    }

    pub fn is_unlimited(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    /// Limit for the credential at `index` in configured key order.
    ///
    /// Keys beyond the supplied list are unlimited.
    pub fn for_credential(&self, index: usize) -> f64 {
        match self.0.as_slice() {
            [] => f64::INFINITY,
            [only] => *only,
            many => many.get(index).copied().unwrap_or(f64::INFINITY),
        }
    }
}

impl fmt::Display for HardLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("unlimited");
        }
        let joined = self
            .0
            .iter()
            .map(|v| format!("{v:.1}"))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn csv(n: usize, v: f64) -> String {
        vec![v.to_string(); n].join(",")
    }

    const SITES: [&str; 2] = ["site-a", "site-b"];

    #[rstest]
    #[case("", ValidationError::NoFactors)]
    #[case("1,1,1", ValidationError::WrongFactorCount(3))]
    #[case("1,x", ValidationError::Unparsable("x".into()))]
    fn test_factor_parse_rejects(#[case] input: &str, #[case] expected: ValidationError) {
        assert_eq!(Factors::parse(input).unwrap_err(), expected);
    }

    #[test]
    fn test_factor_out_of_range() {
        let mut values = vec![1.0; 24];
        values[5] = 1.2;
        assert_eq!(Factors::new(values).unwrap_err(), ValidationError::FactorOutOfRange(1.2));
    }

    #[test]
    fn test_half_hourly_index() {
        let mut values = vec![1.0; 48];
        values[2 * 13 + 1] = 0.25;
        let f = Factors::new(values).unwrap();
        assert_eq!(f.at(13, 30), 0.25);
        assert_eq!(f.at(13, 0), 1.0);
    }

    #[test]
    fn test_24_without_site_replaces_granular() {
        let granular = DampeningTable::default()
            .with_factors(&csv(48, 0.5), Some("site-a"), &SITES)
            .unwrap();
        assert_eq!(granular.mode(), "per_site_granular");

        let uniform = granular.with_factors(&csv(24, 0.8), None, &SITES).unwrap();
        assert_eq!(uniform, DampeningTable::uniform(0.8));
    }

    #[test]
    fn test_48_without_site_targets_all() {
        let table = DampeningTable::default()
            .with_factors(&csv(48, 0.7), None, &SITES)
            .unwrap();
        assert_eq!(table.factor_for("site-b", 10, 30), 0.7);
        assert_eq!(table.view(None).site.as_deref(), Some(ALL_SITES));
    }

    #[test]
    fn test_all_requires_48() {
        let err = DampeningTable::default()
            .with_factors(&csv(24, 0.7), Some("all"), &SITES)
            .unwrap_err();
        assert_eq!(err, ValidationError::AllRequiresHalfHourly);
    }

    #[test]
    fn test_unknown_site_rejected() {
        let err = DampeningTable::default()
            .with_factors(&csv(24, 0.7), Some("nope"), &SITES)
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownSite("nope".into()));
    }

    #[test]
    fn test_granular_lookup_order() {
        let table = DampeningTable::default()
            .with_factors(&csv(24, 0.5), Some("site-a"), &SITES)
            .unwrap();
        assert_eq!(table.factor_for("site-a", 12, 0), 0.5);
        assert_eq!(table.factor_for("site-b", 12, 0), 1.0);

        let table = table.with_factors(&csv(48, 0.9), Some("all"), &SITES).unwrap();
        assert_eq!(table.factor_for("site-a", 12, 0), 0.5);
        assert_eq!(table.factor_for("site-b", 12, 0), 0.9);
    }

    #[test]
    fn test_table_serde_is_tagged() {
        let json = serde_json::to_value(DampeningTable::uniform(1.0)).unwrap();
        assert_eq!(json["mode"], "uniform");
        assert_eq!(json["factors"].as_array().unwrap().len(), 24);

        let bad = r#"{"mode":"per_site_granular","sites":{"a":[1.0,2.0]}}"#;
        assert!(serde_json::from_str::<DampeningTable>(bad).is_err());
    }

    #[rstest]
    #[case("5.55", 1, vec![5.6])]
    #[case("5, 3.25", 2, vec![5.0, 3.3])]
    fn test_hard_limit_parse(#[case] input: &str, #[case] keys: usize, #[case] expected: Vec<f64>) {
        assert_eq!(HardLimit::parse(input, keys).unwrap().values(), expected.as_slice());
    }

    #[rstest]
    #[case("0", 1, ValidationError::HardLimitNotPositive(0.0))]
    #[case("-2", 1, ValidationError::HardLimitNotPositive(-2.0))]
    #[case("0.04", 1, ValidationError::HardLimitNotPositive(0.04))]
    #[case("abc", 1, ValidationError::Unparsable("abc".into()))]
    #[case("1,2", 1, ValidationError::TooManyHardLimits { given: 2, credentials: 1 })]
    fn test_hard_limit_rejects(#[case] input: &str, #[case] keys: usize, #[case] expected: ValidationError) {
        assert_eq!(HardLimit::parse(input, keys).unwrap_err(), expected);
    }

    #[test]
    fn test_hard_limit_per_credential() {
        assert_eq!(HardLimit::unlimited().for_credential(0), f64::INFINITY);
        let single = HardLimit::single(4.0).unwrap();
        assert_eq!(single.for_credential(3), 4.0);
        let pair = HardLimit::parse("4,2", 3).unwrap();
        assert_eq!(pair.for_credential(1), 2.0);
        assert_eq!(pair.for_credential(2), f64::INFINITY);
        assert_eq!(pair.to_string(), "4.0,2.0");
    }
}
