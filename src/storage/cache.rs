use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{read_json, write_json};
use crate::domain::redact_api_key;

/// Which remote call a cached body belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedCall<'a> {
    Sites { api_key: &'a str },
    Forecasts { site_id: &'a str },
    Actuals { site_id: &'a str },
}

/// Last good raw response per remote call, used when the API is unreachable
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    /// Number of configured API keys; a single key keeps unsuffixed names
    credentials: usize,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, credentials: usize) -> Self {
        Self {
            dir: dir.into(),
            credentials,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, call: CachedCall<'_>) -> PathBuf {
        let name = match call {
            CachedCall::Sites { .. } if self.credentials <= 1 => "solcast-sites.json".to_string(),
            CachedCall::Sites { api_key } => format!("solcast-sites-{api_key}.json"),
            CachedCall::Forecasts { site_id } => format!("forecasts_{site_id}.json"),
            CachedCall::Actuals { site_id } => format!("actuals_{site_id}.json"),
        };
        self.dir.join(name)
    }

    pub async fn store<T: Serialize>(&self, call: CachedCall<'_>, body: &T) {
        let path = self.path_for(call);
        if let Err(e) = write_json(&path, body).await {
            warn!(error = %e, path = %path.display(), "failed to write response cache");
        } else {
            debug!(path = %path.display(), "response cached");
        }
    }

    pub async fn load<T: DeserializeOwned>(&self, call: CachedCall<'_>) -> io::Result<Option<T>> {
        let path = self.path_for(call);
        let body = read_json(&path).await?;
        if body.is_some() {
            debug!(path = %path.display(), "using cached response");
        }
        Ok(body)
    }

    /// Redacted form of a cache path for logs
    pub fn describe(&self, call: CachedCall<'_>) -> String {
        match call {
            CachedCall::Sites { api_key } => format!("sites for {}", redact_api_key(api_key)),
            CachedCall::Forecasts { site_id } => format!("forecasts for {site_id}"),
            CachedCall::Actuals { site_id } => format!("actuals for {site_id}"),
        }
    }
}
