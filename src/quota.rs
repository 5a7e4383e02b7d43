//! Daily API call accounting per credential.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::domain::redact_api_key;
use crate::storage::{read_json, write_json};

pub const DEFAULT_DAILY_LIMIT: u32 = 10;

/// Usage as reported by the usage endpoint and kept in the usage file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    #[serde(rename = "daily_limit")]
    pub limit: u32,
    #[serde(rename = "daily_limit_consumed")]
    pub used: u32,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            limit: DEFAULT_DAILY_LIMIT,
            used: 0,
        }
    }
}

impl Quota {
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Tracks calls this process makes against each key's daily allowance
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    dir: PathBuf,
    keys: Vec<String>,
    quotas: HashMap<String, Quota>,
}

impl QuotaTracker {
    pub fn new(dir: impl Into<PathBuf>, keys: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            keys,
            quotas: HashMap::new(),
        }
    }

    pub fn usage_file(&self, api_key: &str) -> PathBuf {
        if self.keys.len() <= 1 {
            self.dir.join("solcast-usage.json")
        } else {
            self.dir.join(format!("solcast-usage-{api_key}.json"))
        }
    }

    pub fn get(&self, api_key: &str) -> Quota {
        self.quotas.get(api_key).copied().unwrap_or_default()
    }

    pub fn can_call(&self, api_key: &str) -> bool {
        !self.get(api_key).is_exhausted()
    }

    /// Accept usage fetched from the API and persist it
    pub async fn set(&mut self, api_key: &str, quota: Quota) {
        self.quotas.insert(api_key.to_string(), quota);
        self.persist(api_key).await;
    }

    /// Fall back to the usage file, or the default allowance when there is none
    pub async fn restore(&mut self, api_key: &str) -> Quota {
        let path = self.usage_file(api_key);
        let quota = match read_json::<Quota>(&path).await {
            Ok(Some(q)) => {
                info!(key = %redact_api_key(api_key), used = q.used, limit = q.limit, "loaded cached API usage");
                q
            }
            Ok(None) => {
                warn!(key = %redact_api_key(api_key), "no cached API usage, assuming defaults");
                Quota::default()
            }
            Err(e) => {
                warn!(key = %redact_api_key(api_key), error = %e, "cached API usage unreadable, assuming defaults");
                Quota::default()
            }
        };
        self.quotas.insert(api_key.to_string(), quota);
        quota
    }

    /// Count one successful call
    pub async fn record_call(&mut self, api_key: &str) -> Quota {
        let mut quota = self.get(api_key);
        quota.used += 1;
        debug!(key = %redact_api_key(api_key), used = quota.used, limit = quota.limit, "API usage incremented");
        self.quotas.insert(api_key.to_string(), quota);
        self.persist(api_key).await;
        quota
    }

    /// Zero every key's counter; the remote side resets at UTC midnight
    pub async fn reset(&mut self) {
        for key in self.keys.clone() {
            let mut quota = self.get(&key);
            quota.used = 0;
            self.quotas.insert(key.clone(), quota);
            self.persist(&key).await;
        }
        info!(keys = self.keys.len(), "API usage counters reset");
    }

    /// `(used, limit)` summed over all keys
    pub fn totals(&self) -> (u32, u32) {
        self.keys.iter().map(|k| self.get(k)).fold((0, 0), |(u, l), q| (u + q.used, l + q.limit))
    }

    async fn persist(&self, api_key: &str) {
        if let Err(e) = self.write(api_key).await {
            warn!(key = %redact_api_key(api_key), error = %e, "failed to write API usage file");
        }
    }

    async fn write(&self, api_key: &str) -> io::Result<()> {
        write_json(&self.usage_file(api_key), &self.get(api_key)).await
    }
}
