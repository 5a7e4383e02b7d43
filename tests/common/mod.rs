#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use figment::providers::{Format, Toml};
use figment::Figment;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use solcast_forecast::config::Config;
use solcast_forecast::engine::SolcastEngine;
use solcast_forecast::solcast::SolcastClient;

pub const USAGE_PATH: &str = "/json/reply/GetUserUsageAllowance";

/// Config pointing at `server`, no retry delays
pub fn config(server: &MockServer, dir: &Path, keys: &str) -> Config {
    let toml = format!(
        r#"
        [server]
        host = "127.0.0.1"
        port = 0
        request_timeout_secs = 10

        [solcast]
        api_key = "{keys}"
        host = "{host}"
        usage_url = "{host}{USAGE_PATH}"
        http_timeout_secs = 5
        fetch_retries = 1
        fetch_retry_delay_secs = 0.0
        busy_attempts = 2
        busy_backoff_secs = 0.0
        busy_jitter_secs = 0.0

        [storage]
        data_dir = "{dir}"
        "#,
        host = server.uri(),
        dir = dir.display(),
    );
    Figment::new()
        .merge(Toml::string(&toml))
        .extract()
        .expect("test config")
}

pub fn engine(cfg: &Config) -> SolcastEngine {
    let client = SolcastClient::new(&cfg.solcast).expect("client");
    SolcastEngine::new(cfg, Arc::new(client)).expect("engine")
}

/// Start of the half hour containing now
pub fn current_slot() -> DateTime<Utc> {
    let now = Utc::now().timestamp();
    Utc.timestamp_opt(now - now % 1800, 0).unwrap()
}

pub fn forecasts_body(first_start: DateTime<Utc>, values: &[f64]) -> Value {
    let forecasts: Vec<Value> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let end = first_start + Duration::minutes(30 * (i as i64 + 1));
            json!({
                "period_end": end.to_rfc3339(),
                "period": "PT30M",
                "pv_estimate": v,
                "pv_estimate10": v * 0.5,
                "pv_estimate90": v * 1.5,
            })
        })
        .collect();
    json!({ "forecasts": forecasts })
}

pub fn actuals_body(first_start: DateTime<Utc>, values: &[f64]) -> Value {
    let actuals: Vec<Value> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let end = first_start + Duration::minutes(30 * (i as i64 + 1));
            json!({ "period_end": end.to_rfc3339(), "period": "PT30M", "pv_estimate": v })
        })
        .collect();
    json!({ "estimated_actuals": actuals })
}

pub async fn mount_sites(server: &MockServer, key: &str, site_ids: &[&str]) {
    let sites: Vec<Value> = site_ids
        .iter()
        .map(|id| json!({ "resource_id": id, "name": format!("Roof {id}"), "capacity": 5.0, "capacity_dc": 6.0 }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/rooftop_sites"))
        .and(query_param("api_key", key))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sites": sites, "page_count": 1 })))
        .mount(server)
        .await;
}

pub async fn mount_usage(server: &MockServer, key: &str, limit: u32, used: u32) {
    Mock::given(method("GET"))
        .and(path(USAGE_PATH))
        .and(query_param("api_key", key))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "daily_limit": limit,
            "daily_limit_consumed": used,
            "daily_limit_remaining": limit.saturating_sub(used),
        })))
        .mount(server)
        .await;
}

/// Healthy forecast and actuals endpoints for `site`, expecting the given call counts
pub async fn mount_site_data(server: &MockServer, site: &str, forecast_calls: u64, actuals_calls: u64) {
    let slot = current_slot();
    Mock::given(method("GET"))
        .and(path(format!("/rooftop_sites/{site}/forecasts")))
        .respond_with(ResponseTemplate::new(200).set_body_json(forecasts_body(slot, &[2.0, 3.0, 4.0, 3.0])))
        .expect(forecast_calls)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/rooftop_sites/{site}/estimated_actuals")))
        .and(query_param("hours", "168"))
        .respond_with(ResponseTemplate::new(200).set_body_json(actuals_body(slot - Duration::hours(2), &[1.0, 1.5])))
        .expect(actuals_calls)
        .mount(server)
        .await;
}
