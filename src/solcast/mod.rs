//! Remote forecasting API: typed responses, retry policy and the HTTP client.

pub mod models;
pub mod retry;

pub use models::*;
pub use retry::*;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SolcastConfig;
use crate::domain::redact_api_key;
use crate::quota::Quota;

/// Why a remote call produced no usable data
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote API returned HTTP {status}")]
    Transient { status: u16 },
    #[error("remote API still busy after {attempts} attempts")]
    Busy { attempts: u32 },
    #[error("daily API quota exhausted")]
    QuotaExhausted,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("response cache unavailable: {0}")]
    Cache(#[from] std::io::Error),
}

impl FetchError {
    /// Failures after which the cached response may stand in
    pub fn allows_cache_fallback(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Http(_))
    }
}

/// Source of rooftop sites, usage and forecasts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn rooftop_sites(&self, api_key: &str) -> Result<SitesResponse, FetchError>;

    async fn usage(&self, api_key: &str) -> Result<Quota, FetchError>;

    async fn forecasts(&self, site_id: &str, api_key: &str, hours: i64) -> Result<ForecastsResponse, FetchError>;

    async fn estimated_actuals(&self, site_id: &str, api_key: &str, hours: i64) -> Result<ActualsResponse, FetchError>;
}

/// Delay from config seconds; negative, NaN and infinite values are errors
fn seconds(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("solcast.{name} must be a finite, non-negative number of seconds, got {secs}"))
}

#[derive(Clone)]
pub struct SolcastClient {
    host: String,
    usage_url: String,
    client: reqwest::Client,
    transient: RetryPolicy,
    busy: RetryPolicy,
}

impl SolcastClient {
    pub fn new(config: &SolcastConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("solcast-forecast/0.2"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            host: config.host.trim_end_matches('/').to_string(),
            usage_url: config.usage_url.clone(),
            client,
            transient: RetryPolicy::fixed(
                config.fetch_retries + 1,
                seconds("fetch_retry_delay_secs", config.fetch_retry_delay_secs)?,
            ),
            busy: RetryPolicy::linear(
                config.busy_attempts,
                seconds("busy_backoff_secs", config.busy_backoff_secs)?,
                seconds("busy_jitter_secs", config.busy_jitter_secs)?,
            ),
        })
    }

    /// GET with the shared retry rules.
    ///
    /// 429 follows the busy policy and never falls back to cache. Any other
    /// non-200 status or connection error follows the transient policy.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        what: &'static str,
    ) -> Result<T, FetchError> {
        let mut transient_attempt = 0;
        let mut busy_attempt = 0;

        loop {
            let failure = match self.client.get(url).query(query).send().await {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    let body = resp.text().await?;
                    return serde_json::from_str(&body)
                        .map_err(|e| FetchError::Malformed(format!("{what}: {e}")));
                }
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    busy_attempt += 1;
                    if !self.busy.should_retry(busy_attempt) {
                        warn!(call = what, attempts = busy_attempt, "API still busy, giving up");
                        return Err(FetchError::Busy {
                            attempts: busy_attempt,
                        });
                    }
                    let delay = self.busy.delay_for(busy_attempt);
                    warn!(call = what, attempt = busy_attempt, delay_ms = delay.as_millis() as u64, "API busy, pausing before retry");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(resp) => {
                    let status = resp.status();
                    match status {
                        StatusCode::BAD_REQUEST => {
                            warn!(call = what, "rooftop site is missing capacity or tuning data")
                        }
                        StatusCode::NOT_FOUND => {
                            warn!(call = what, "rooftop site cannot be found or is not accessible")
                        }
                        _ => {}
                    }
                    FetchError::Transient {
                        status: status.as_u16(),
                    }
                }
                Err(e) => FetchError::Http(e),
            };

            transient_attempt += 1;
            if !self.transient.should_retry(transient_attempt) {
                warn!(call = what, attempts = transient_attempt, error = %failure, "remote call failed");
                return Err(failure);
            }
            let delay = self.transient.delay_for(transient_attempt);
            warn!(call = what, attempt = transient_attempt, error = %failure, delay_ms = delay.as_millis() as u64, "remote call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ForecastSource for SolcastClient {
    async fn rooftop_sites(&self, api_key: &str) -> Result<SitesResponse, FetchError> {
        debug!(key = %redact_api_key(api_key), "fetching rooftop sites");
        let url = format!("{}/rooftop_sites", self.host);
        let query = [("format", "json".to_string()), ("api_key", api_key.to_string())];
        let mut resp: SitesResponse = self.get_json(&url, &query, "rooftop_sites").await?;
        for site in &mut resp.sites {
            site.api_key = api_key.to_string();
        }
        info!(key = %redact_api_key(api_key), sites = resp.sites.len(), "rooftop sites fetched");
        Ok(resp)
    }

    async fn usage(&self, api_key: &str) -> Result<Quota, FetchError> {
        let query = [("api_key", api_key.to_string())];
        let quota: Quota = self.get_json(&self.usage_url, &query, "usage").await?;
        info!(key = %redact_api_key(api_key), used = quota.used, limit = quota.limit, "API usage fetched");
        Ok(quota)
    }

    async fn forecasts(&self, site_id: &str, api_key: &str, hours: i64) -> Result<ForecastsResponse, FetchError> {
        let url = format!("{}/rooftop_sites/{site_id}/forecasts", self.host);
        let query = [
            ("format", "json".to_string()),
            ("api_key", api_key.to_string()),
            ("hours", hours.to_string()),
        ];
        let resp: ForecastsResponse = self.get_json(&url, &query, "forecasts").await?;
        debug!(site = site_id, records = resp.forecasts.len(), hours, "forecasts fetched");
        Ok(resp)
    }

    async fn estimated_actuals(&self, site_id: &str, api_key: &str, hours: i64) -> Result<ActualsResponse, FetchError> {
        let url = format!("{}/rooftop_sites/{site_id}/estimated_actuals", self.host);
        let query = [
            ("format", "json".to_string()),
            ("api_key", api_key.to_string()),
            ("hours", hours.to_string()),
        ];
        let resp: ActualsResponse = self.get_json(&url, &query, "estimated_actuals").await?;
        debug!(site = site_id, records = resp.estimated_actuals.len(), hours, "estimated actuals fetched");
        Ok(resp)
    }
}
