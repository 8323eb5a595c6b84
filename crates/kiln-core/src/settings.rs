//! Tool settings from `<config_dir>/kiln/config.toml`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::apply::{ApplyOptions, DEFAULT_CONCURRENCY};
use crate::labels::DEFAULT_FIELD_MANAGER;
use crate::revision::{DEFAULT_RETENTION, RevisionOptions};
use crate::rollout::{DEFAULT_JITTER, RolloutOptions};

pub const SETTINGS_FILE: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => bail!("unknown output format '{}' (expected human or json)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplySettings {
    pub concurrency: usize,
    pub prune: bool,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            prune: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RolloutSettings {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RevisionSettings {
    pub retention: usize,
}

impl Default for RevisionSettings {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSettings {
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub field_manager: String,
    pub apply: ApplySettings,
    pub rollout: RolloutSettings,
    pub revisions: RevisionSettings,
    pub output: OutputSettings,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            apply: ApplySettings::default(),
            rollout: RolloutSettings::default(),
            revisions: RevisionSettings::default(),
            output: OutputSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.field_manager.trim().is_empty() {
            bail!("field_manager must not be empty");
        }
        if self.apply.concurrency < 1 {
            bail!("apply.concurrency must be at least 1");
        }
        if self.revisions.retention < 1 {
            bail!("revisions.retention must be at least 1");
        }
        if self.rollout.poll_interval_ms < 100 {
            bail!("rollout.poll_interval_ms must be at least 100");
        }
        Ok(())
    }

    /// Apply `KILN_OUTPUT` and `KILN_FIELD_MANAGER` through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(format) = lookup("KILN_OUTPUT") {
            self.output.format = format.parse().context("Invalid KILN_OUTPUT")?;
        }
        if let Some(manager) = lookup("KILN_FIELD_MANAGER") {
            if !manager.trim().is_empty() {
                self.field_manager = manager;
            }
        }
        Ok(())
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions::new()
            .with_field_manager(self.field_manager.clone())
            .with_concurrency(self.apply.concurrency)
            .with_prune(self.apply.prune)
    }

    pub fn rollout_options(&self) -> RolloutOptions {
        let poll = Duration::from_millis(self.rollout.poll_interval_ms);
        RolloutOptions::new()
            .with_timeout(Duration::from_secs(self.rollout.timeout_secs))
            .with_poll_interval(poll)
            .with_jitter(DEFAULT_JITTER.min(poll / 10))
    }

    pub fn revision_options(&self) -> RevisionOptions {
        RevisionOptions::default().with_retention(self.revisions.retention)
    }
}

/// Read settings from `path`; a missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    parse_settings_str(&content)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))
}

pub fn parse_settings_str(content: &str) -> Result<Settings> {
    let settings: Settings =
        toml::from_str(content).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
    settings.validate()?;
    Ok(settings)
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    toml::to_string_pretty(settings).context("Failed to serialize settings to TOML")
}
