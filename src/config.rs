use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Duration;
use serde::Deserialize;

use crate::slots::model::EditPolicy;
use crate::slots::segmenter::{DEFAULT_GRANULARITY_MINUTES, Segmenter};
use crate::slots::store::DEFAULT_STORAGE_KEY;

/// One week. Coarser steps leave nothing to edit at hour resolution.
pub const MAX_GRANULARITY_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub policy: EditPolicy,
    pub granularity_minutes: i64,
    pub storage_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy: EditPolicy::Legacy,
            granularity_minutes: DEFAULT_GRANULARITY_MINUTES,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl Settings {
    pub fn segmenter(&self) -> Segmenter {
        // An out-of-range value yields a zero step, which segments nothing.
        let granularity =
            Duration::try_minutes(self.granularity_minutes).unwrap_or(Duration::zero());
        Segmenter::new(granularity, self.policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.granularity_minutes <= 0 {
            bail!(
                "granularity_minutes must be greater than zero, got {}",
                self.granularity_minutes
            );
        }
        if self.granularity_minutes > MAX_GRANULARITY_MINUTES {
            bail!(
                "granularity_minutes must be at most {MAX_GRANULARITY_MINUTES}, got {}",
                self.granularity_minutes
            );
        }
        if self.storage_key.trim().is_empty() {
            bail!("storage_key must not be empty");
        }
        Ok(())
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read settings file {}", path.display()))?;
    parse_settings_text(&content)
}

pub fn parse_settings_text(content: &str) -> Result<Settings> {
    let raw = serde_json::from_str::<SettingsFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != 1 {
        bail!(
            "unsupported settings version {}; expected version 1",
            raw.version
        );
    }

    let settings = Settings {
        policy: raw.policy,
        granularity_minutes: raw.granularity_minutes,
        storage_key: raw.storage_key,
    };
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    version: u32,
    #[serde(default)]
    policy: EditPolicy,
    #[serde(default = "default_granularity_minutes")]
    granularity_minutes: i64,
    #[serde(default = "default_storage_key")]
    storage_key: String,
}

fn default_granularity_minutes() -> i64 {
    DEFAULT_GRANULARITY_MINUTES
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}
