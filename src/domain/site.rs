use serde::{Deserialize, Serialize};

use super::ForecastRecord;

/// A rooftop site as reported by the sites endpoint.
///
/// Location fields are dropped on purpose; only what the engine and the
/// host need to describe the site is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_dc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azimuth: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tilt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_factor: Option<f64>,
    /// Credential that owns the site; never serialized
    #[serde(skip)]
    pub api_key: String,
}

/// Stored history and forecast for one site, ordered by `period_start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSeries {
    pub forecasts: Vec<ForecastRecord>,
    /// Today's dampened, limited energy (kWh), set on every rebuild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tally: Option<f64>,
}

impl SiteSeries {
    pub fn new(forecasts: Vec<ForecastRecord>) -> Self {
        Self {
            forecasts,
            tally: None,
        }
    }

    pub fn len(&self) -> usize {
        self.forecasts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forecasts.is_empty()
    }
}

/// Shorten a credential for logs: `******` followed by its last six characters
pub fn redact_api_key(api_key: &str) -> String {
    let tail: String = api_key
        .chars()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("******{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_api_key() {
        assert_eq!(redact_api_key("abcdefghijkl"), "******ghijkl");
        assert_eq!(redact_api_key("abc"), "******abc");
    }

    #[test]
    fn test_site_deserializes_ignoring_location() {
        let site: Site = serde_json::from_str(
            r#"{"resource_id":"1111-aaaa","name":"House","capacity":5.0,
                "longitude":151.2,"latitude":-33.8,"tilt":30}"#,
        )
        .unwrap();
        assert_eq!(site.resource_id, "1111-aaaa");
        assert_eq!(site.tilt, Some(30.0));
        assert!(site.api_key.is_empty());
        let back = serde_json::to_string(&site).unwrap();
        assert!(!back.contains("longitude"));
    }
}
