use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db;
use crate::store::MAX_BATCH_WRITES;

pub const SETTINGS_KEY: &str = "engine";

/// Rename pairs are two writes each.
pub const MAX_RENAME_PAIRS: usize = MAX_BATCH_WRITES / 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub subject: String,
    pub max_batch_writes: usize,
    pub rename_pairs_per_batch: usize,
    pub backup_before_apply: bool,
    pub applied_by: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            subject: "english".to_string(),
            max_batch_writes: 450,
            rename_pairs_per_batch: 225,
            backup_before_apply: true,
            applied_by: "scheduler".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn batch_writes(&self) -> usize {
        self.max_batch_writes.clamp(1, MAX_BATCH_WRITES)
    }

    pub fn rename_pairs(&self) -> usize {
        self.rename_pairs_per_batch.clamp(1, MAX_RENAME_PAIRS)
    }

    /// Saved settings over the defaults. Malformed saved values fall back to
    /// the defaults field by field.
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let mut settings = Self::default();
        if let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? {
            if let Some(obj) = saved.as_object() {
                for (k, v) in obj {
                    let _ = settings.set_field(k, v);
                }
            }
        }
        Ok(settings)
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(self)?)
    }

    /// Apply a partial update; unknown fields and bad values are rejected
    /// before anything changes.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (k, v) in patch {
            next.set_field(k, v)?;
        }
        *self = next;
        Ok(())
    }

    fn set_field(&mut self, key: &str, value: &Value) -> Result<(), String> {
        match key {
            "subject" => self.subject = parse_name(value, key)?,
            "appliedBy" => self.applied_by = parse_name(value, key)?,
            "maxBatchWrites" => {
                self.max_batch_writes = parse_limit(value, key, MAX_BATCH_WRITES)?
            }
            "renamePairsPerBatch" => {
                self.rename_pairs_per_batch = parse_limit(value, key, MAX_RENAME_PAIRS)?
            }
            "backupBeforeApply" => {
                self.backup_before_apply = value
                    .as_bool()
                    .ok_or_else(|| format!("{key} must be a boolean"))?
            }
            _ => return Err(format!("unknown settings field: {key}")),
        }
        Ok(())
    }
}

fn parse_name(value: &Value, key: &str) -> Result<String, String> {
    let s = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| format!("{key} must be a string"))?;
    if s.is_empty() || s.len() > 80 {
        return Err(format!("{key} must be 1..=80 characters"));
    }
    Ok(s.to_string())
}

fn parse_limit(value: &Value, key: &str, max: usize) -> Result<usize, String> {
    let n = value
        .as_u64()
        .ok_or_else(|| format!("{key} must be a positive integer"))?;
    if n == 0 {
        return Err(format!("{key} must be a positive integer"));
    }
    Ok((n as usize).min(max))
}
