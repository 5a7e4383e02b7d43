//! Ordered, validated migration chain for versioned JSON documents.
//!
//! Each step is a pure `Document -> Document` function covering versions
//! `from_version..to_version`. Version numbers may skip (a release that did
//! not change the shape), but the steps themselves must chain without gaps.

use serde_json::{Map, Value};
use thiserror::Error;

pub type Document = Map<String, Value>;

pub struct MigrationStep {
    pub from_version: u32,
    pub to_version: u32,
    pub description: &'static str,
    pub migrate_fn: fn(Document) -> Document,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub original_version: u32,
    pub final_version: u32,
    pub steps_applied: u32,
    pub step_descriptions: Vec<&'static str>,
}

impl MigrationReport {
    pub fn changed(&self) -> bool {
        self.steps_applied > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error("migration chain is empty")]
    Empty,
    #[error("migration step from v{found} does not follow v{expected}")]
    Gap { expected: u32, found: u32 },
    #[error("migration step v{from} -> v{to} does not move forward")]
    Backwards { from: u32, to: u32 },
    #[error("migration chain ends at v{ends_at}, expected v{current}")]
    WrongTarget { ends_at: u32, current: u32 },
    #[error("document version {found} is newer than supported version {current}")]
    FutureVersion { found: u32, current: u32 },
}

pub struct MigrationRegistry {
    steps: Vec<MigrationStep>,
    current_version: u32,
}

impl MigrationRegistry {
    /// Build a registry, checking that the steps chain from the first
    /// `from_version` to `current_version` with no gaps or overlaps
    pub fn new(mut steps: Vec<MigrationStep>, current_version: u32) -> Result<Self, MigrationError> {
        steps.sort_by_key(|s| s.from_version);
        let first = steps.first().ok_or(MigrationError::Empty)?;

        let mut expected = first.from_version;
        for step in &steps {
            if step.from_version != expected {
                return Err(MigrationError::Gap {
                    expected,
                    found: step.from_version,
                });
            }
            if step.to_version <= step.from_version {
                return Err(MigrationError::Backwards {
                    from: step.from_version,
                    to: step.to_version,
                });
            }
            expected = step.to_version;
        }
        if expected != current_version {
            return Err(MigrationError::WrongTarget {
                ends_at: expected,
                current: current_version,
            });
        }

        Ok(Self {
            steps,
            current_version,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn oldest_version(&self) -> u32 {
        self.steps.first().map(|s| s.from_version).unwrap_or(self.current_version)
    }

    /// Bring `doc` up to the current version.
    ///
    /// A missing `version` counts as the oldest known version. Every step
    /// whose `to_version` is above the document's version runs, in order.
    pub fn migrate(&self, mut doc: Document) -> Result<(Document, MigrationReport), MigrationError> {
        let original_version = doc
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or_else(|| self.oldest_version());

        if original_version > self.current_version {
            return Err(MigrationError::FutureVersion {
                found: original_version,
                current: self.current_version,
            });
        }

        let mut version = original_version;
        let mut step_descriptions = Vec::new();
        for step in &self.steps {
            if version >= step.to_version {
                continue;
            }
            doc = (step.migrate_fn)(doc);
            version = step.to_version;
            step_descriptions.push(step.description);
        }
        doc.insert("version".into(), Value::from(version));

        Ok((
            doc,
            MigrationReport {
                original_version,
                final_version: version,
                steps_applied: step_descriptions.len() as u32,
                step_descriptions,
            },
        ))
    }
}
