//! Engine configuration: an optional TOML file, then `FOLDSTORE_*`
//! environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// How applied events reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Append every event to the log, snapshot periodically.
    #[default]
    EventLog,
    /// Debounced whole-state snapshots, no log.
    Snapshot,
    /// In-memory only.
    Disabled,
}

impl FromStr for PersistenceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event_log" | "eventlog" | "log" => Ok(Self::EventLog),
            "snapshot" => Ok(Self::Snapshot),
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            other => Err(anyhow!("unknown persistence mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub persistence: PersistenceMode,

    /// Minimum wall time between snapshots in event-log mode.
    pub snapshot_interval_ms: u64,
    /// How long a flush waits to batch up further log entries.
    pub flush_debounce_ms: u64,
    /// Quiet period before a whole-state save in snapshot mode.
    pub save_debounce_ms: u64,

    /// Attempts per persistence write, including the first.
    pub write_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Drop log entries a durable snapshot already covers.
    pub compact_log: bool,

    pub legacy_migration: bool,
    /// Legacy flat keys are `<legacy_prefix><slice name>`.
    pub legacy_prefix: String,

    /// Root directory for the disk backend.
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceMode::EventLog,
            snapshot_interval_ms: 200,
            flush_debounce_ms: 0,
            save_debounce_ms: 200,
            write_attempts: 3,
            retry_backoff_ms: 50,
            compact_log: true,
            legacy_migration: true,
            legacy_prefix: String::new(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file, then apply environment overrides
    /// (including a `.env` file if present).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => load_config(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.log_summary();
        Ok(config)
    }

    /// Apply `FOLDSTORE_*` overrides from any lookup (the process
    /// environment in production, a map in tests).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        override_from(&lookup, "FOLDSTORE_PERSISTENCE", &mut self.persistence)?;
        override_from(&lookup, "FOLDSTORE_SNAPSHOT_INTERVAL_MS", &mut self.snapshot_interval_ms)?;
        override_from(&lookup, "FOLDSTORE_FLUSH_DEBOUNCE_MS", &mut self.flush_debounce_ms)?;
        override_from(&lookup, "FOLDSTORE_SAVE_DEBOUNCE_MS", &mut self.save_debounce_ms)?;
        override_from(&lookup, "FOLDSTORE_WRITE_ATTEMPTS", &mut self.write_attempts)?;
        override_from(&lookup, "FOLDSTORE_RETRY_BACKOFF_MS", &mut self.retry_backoff_ms)?;
        override_from(&lookup, "FOLDSTORE_COMPACT_LOG", &mut self.compact_log)?;
        override_from(&lookup, "FOLDSTORE_LEGACY_MIGRATION", &mut self.legacy_migration)?;
        override_from(&lookup, "FOLDSTORE_LEGACY_PREFIX", &mut self.legacy_prefix)?;
        override_from(&lookup, "FOLDSTORE_DATA_DIR", &mut self.data_dir)?;

        if self.write_attempts == 0 {
            return Err(anyhow!("write_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn log_summary(&self) {
        tracing::info!("Engine config loaded:");
        tracing::info!("  persistence: {:?}", self.persistence);
        tracing::info!("  snapshot_interval_ms: {}", self.snapshot_interval_ms);
        tracing::info!("  flush_debounce_ms: {}", self.flush_debounce_ms);
        tracing::info!("  save_debounce_ms: {}", self.save_debounce_ms);
        tracing::info!(
            "  write_attempts: {} (backoff {} ms)",
            self.write_attempts,
            self.retry_backoff_ms
        );
        tracing::info!("  compact_log: {}", self.compact_log);
        tracing::info!(
            "  legacy_migration: {} (prefix {:?})",
            self.legacy_migration,
            self.legacy_prefix
        );
        tracing::info!("  data_dir: {}", self.data_dir.display());
    }
}

fn override_from<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key}={raw:?} is invalid: {e}"))?;
    }
    Ok(())
}

/// Load and parse a TOML config file. Missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}
