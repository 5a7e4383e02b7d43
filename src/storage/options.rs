use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;

use super::migrate::{Document, MigrationRegistry, MigrationStep};
use super::{read_json, write_json};
use crate::config::EngineConfig;
use crate::domain::EstimateField;
use crate::forecast::{DampeningTable, HardLimit, HOURLY_FACTORS};

pub const OPTIONS_VERSION: u32 = 15;

pub const OPTIONS_FILE: &str = "solcast-options.json";

/// Hard limit older documents used to mean "no limit", in kW
const LEGACY_UNLIMITED_KW: f64 = 100.0;

/// Options the host may change at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    pub version: u32,
    #[serde(default)]
    pub key_estimate: EstimateField,
    pub custom_hours: u32,
    pub dampening: DampeningTable,
    #[serde(default)]
    pub hard_limit: HardLimit,
    /// Host automation mode as stored by the host: 0 off, 1 sunrise to
    /// sunset, 2 around the clock.
    ///
    /// Only carried through migrations. The scheduler ignores it and polls
    /// around the clock at `scheduler.auto_update_minutes`, so mode 1 behaves
    /// like mode 2.
    #[serde(default)]
    pub auto_update: u8,
}

impl RuntimeOptions {
    /// Fresh options seeded from static configuration
    pub fn from_config(engine: &EngineConfig, credentials: usize) -> Result<Self> {
        let hard_limit = match &engine.hard_limit {
            Some(csv) => HardLimit::parse(csv, credentials).context("engine.hard_limit")?,
            None => HardLimit::unlimited(),
        };
        Ok(Self {
            version: OPTIONS_VERSION,
            key_estimate: engine.key_estimate,
            custom_hours: engine.custom_hours,
            dampening: DampeningTable::uniform(engine.default_damp_factor.clamp(0.0, 1.0)),
            hard_limit,
            auto_update: 0,
        })
    }
}

fn damp_key(hour: usize) -> String {
    format!("damp{hour:02}")
}

fn v4_drop_auto_poll(mut doc: Document) -> Document {
    doc.remove("const_disableautopoll");
    doc
}

fn v5_hourly_dampening(mut doc: Document) -> Document {
    for hour in 0..HOURLY_FACTORS {
        doc.insert(damp_key(hour), json!(1.0));
    }
    doc
}

fn v6_custom_hour_sensor(mut doc: Document) -> Document {
    doc.insert("custom_hour_sensor".into(), json!(1));
    doc
}

fn v7_key_estimate(mut doc: Document) -> Document {
    doc.insert("key_estimate".into(), json!("estimate"));
    doc
}

fn v9_api_quota(mut doc: Document) -> Document {
    doc.entry("api_quota").or_insert_with(|| json!("10"));
    doc
}

fn v12_auto_update_and_hard_limit(mut doc: Document) -> Document {
    let auto_update = match doc.get("auto_update") {
        Some(Value::Bool(b)) => u64::from(*b),
        Some(v) => v.as_u64().unwrap_or(0),
        None => 0,
    };
    doc.insert("auto_update".into(), json!(auto_update));
    if doc.get("hard_limit").map_or(true, Value::is_null) {
        doc.insert("hard_limit".into(), json!(100000));
    }
    doc
}

fn v14_hard_limit_per_account(mut doc: Document) -> Document {
    let watts = doc
        .remove("hard_limit")
        .and_then(|v| v.as_f64())
        .unwrap_or(100000.0);
    doc.insert("hard_limit_api".into(), json!(format!("{:.1}", watts / 1000.0)));
    doc
}

fn v15_typed_options(mut doc: Document) -> Document {
    let factors: Vec<f64> = (0..HOURLY_FACTORS)
        .map(|hour| {
            doc.remove(&damp_key(hour))
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0)
                .clamp(0.0, 1.0)
        })
        .collect();
    doc.insert("dampening".into(), json!({ "mode": "uniform", "factors": factors }));

    let limits: Vec<f64> = doc
        .remove("hard_limit_api")
        .and_then(|v| v.as_str().map(str::to_string))
        .map(|csv| {
            csv.split(',')
                .filter_map(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v > 0.0)
                .collect()
        })
        .unwrap_or_default();
    let limits = if limits.iter().all(|v| *v >= LEGACY_UNLIMITED_KW) {
        Vec::new()
    } else {
        limits
    };
    doc.insert("hard_limit".into(), json!(limits));

    let custom_hours = doc
        .remove("custom_hour_sensor")
        .and_then(|v| v.as_u64())
        .unwrap_or(1);
    doc.insert("custom_hours".into(), json!(custom_hours));

    // Usage limits now come from the usage endpoint
    doc.remove("api_quota");
    doc
}

pub fn options_registry() -> Result<MigrationRegistry> {
    let steps = vec![
        MigrationStep { from_version: 1, to_version: 4, description: "drop auto-poll flag", migrate_fn: v4_drop_auto_poll },
        MigrationStep { from_version: 4, to_version: 5, description: "hourly dampening factors", migrate_fn: v5_hourly_dampening },
        MigrationStep { from_version: 5, to_version: 6, description: "custom hours sensor", migrate_fn: v6_custom_hour_sensor },
        MigrationStep { from_version: 6, to_version: 7, description: "selectable estimate field", migrate_fn: v7_key_estimate },
        MigrationStep { from_version: 7, to_version: 9, description: "API quota", migrate_fn: v9_api_quota },
        MigrationStep { from_version: 9, to_version: 12, description: "auto update mode and hard limit", migrate_fn: v12_auto_update_and_hard_limit },
        MigrationStep { from_version: 12, to_version: 14, description: "hard limit per account in kW", migrate_fn: v14_hard_limit_per_account },
        MigrationStep { from_version: 14, to_version: 15, description: "typed dampening and hard limit", migrate_fn: v15_typed_options },
    ];
    Ok(MigrationRegistry::new(steps, OPTIONS_VERSION)?)
}

/// Loads, migrates and saves the options document
#[derive(Debug, Clone)]
pub struct OptionsStore {
    path: PathBuf,
}

impl OptionsStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(OPTIONS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, upgrading and rewriting it if it is older than
    /// the current version. A missing file yields `defaults`, which are saved.
    pub async fn load_or_init(&self, defaults: RuntimeOptions) -> Result<RuntimeOptions> {
        let doc: Option<Value> = read_json(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;

        let Some(doc) = doc else {
            info!(path = %self.path.display(), "no options document, writing defaults");
            self.save(&defaults).await?;
            return Ok(defaults);
        };

        let doc = match doc {
            Value::Object(map) => map,
            other => anyhow::bail!("options document must be a JSON object, got {other}"),
        };

        let (doc, report) = options_registry()?.migrate(doc)?;
        let options: RuntimeOptions = serde_json::from_value(Value::Object(doc))
            .context("options document does not match the current shape")?;

        if report.changed() {
            info!(
                from = report.original_version,
                to = report.final_version,
                steps = ?report.step_descriptions,
                "options upgraded"
            );
            self.save(&options).await?;
        }
        Ok(options)
    }

    pub async fn save(&self, options: &RuntimeOptions) -> Result<()> {
        write_json(&self.path, options)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn defaults() -> RuntimeOptions {
        RuntimeOptions::from_config(&EngineConfig::default(), 1).unwrap()
    }

    #[test]
    fn test_registry_is_contiguous() {
        let registry = options_registry().unwrap();
        assert_eq!(registry.current_version(), OPTIONS_VERSION);
        assert_eq!(registry.oldest_version(), 1);
    }

    #[test]
    fn test_v4_document_reaches_typed_shape() {
        let doc = json!({"version": 4, "api_key": "abc", "const_disableautopoll": true});
        let (doc, report) = options_registry()
            .unwrap()
            .migrate(doc.as_object().cloned().unwrap())
            .unwrap();
        assert_eq!(report.steps_applied, 7);

        let options: RuntimeOptions = serde_json::from_value(Value::Object(doc)).unwrap();
        assert_eq!(options.version, OPTIONS_VERSION);
        assert_eq!(options.key_estimate, EstimateField::Estimate);
        assert_eq!(options.custom_hours, 1);
        assert_eq!(options.dampening, DampeningTable::uniform(1.0));
        // 100000 W was the old "no limit" default
        assert!(options.hard_limit.is_unlimited());
    }

    #[test]
    fn test_v14_document_keeps_custom_values() {
        let mut doc = json!({
            "version": 14,
            "key_estimate": "estimate90",
            "custom_hour_sensor": 4,
            "hard_limit_api": "5.0,3.5",
            "api_quota": "50",
            "auto_update": 2,
        });
        let map = doc.as_object_mut().unwrap();
        for hour in 0..24 {
            map.insert(damp_key(hour), json!(if hour == 12 { 0.8 } else { 1.0 }));
        }

        let (doc, _) = options_registry().unwrap().migrate(map.clone()).unwrap();
        assert!(!doc.contains_key("damp12"));
        assert!(!doc.contains_key("api_quota"));

        let options: RuntimeOptions = serde_json::from_value(Value::Object(doc)).unwrap();
        assert_eq!(options.key_estimate, EstimateField::Estimate90);
        assert_eq!(options.custom_hours, 4);
        assert_eq!(options.auto_update, 2);
        assert_eq!(options.hard_limit.values(), &[5.0, 3.5]);
        assert_eq!(options.dampening.factor_for("any", 12, 0), 0.8);
    }

    #[test]
    fn test_v12_keeps_existing_hard_limit() {
        let doc = json!({"version": 11, "hard_limit": 7000, "auto_update": true});
        let (doc, _) = options_registry()
            .unwrap()
            .migrate(doc.as_object().cloned().unwrap())
            .unwrap();
        let options: RuntimeOptions = serde_json::from_value(Value::Object(doc)).unwrap();
        assert_eq!(options.hard_limit.values(), &[7.0]);
        assert_eq!(options.auto_update, 1);
    }

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let store = OptionsStore::new(dir.path());
        let options = store.load_or_init(defaults()).await.unwrap();
        assert_eq!(options, defaults());
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_old_file_is_upgraded_on_disk() {
        let dir = tempdir().unwrap();
        let store = OptionsStore::new(dir.path());
        std::fs::write(store.path(), r#"{"version": 7, "key_estimate": "estimate10"}"#).unwrap();

        let options = store.load_or_init(defaults()).await.unwrap();
        assert_eq!(options.key_estimate, EstimateField::Estimate10);

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk["version"], json!(OPTIONS_VERSION));
    }

    #[tokio::test]
    async fn test_future_file_is_rejected() {
        let dir = tempdir().unwrap();
        let store = OptionsStore::new(dir.path());
        std::fs::write(store.path(), r#"{"version": 99}"#).unwrap();
        assert!(store.load_or_init(defaults()).await.is_err());
    }
}
