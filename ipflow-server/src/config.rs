use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ipflow_core::SlaPolicies;

/// File name of the SQLite database inside `state_dir`.
pub const DB_FILE_NAME: &str = "ipflow-state.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// How often the overdue sweep runs.
    pub sweep_interval: Duration,
    /// If set, notifications are appended to this JSONL file instead of
    /// only being logged.
    pub notification_outbox_path: Option<PathBuf>,
    /// Optional JSON array of stage policies overriding the defaults.
    pub sla_policy_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let sweep_secs = lookup("SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|| "3600".to_string())
            .parse::<u64>()
            .context("SWEEP_INTERVAL_SECS must be a valid number of seconds")?;
        if sweep_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be greater than zero");
        }

        Ok(Config {
            port,
            state_dir,
            sweep_interval: Duration::from_secs(sweep_secs),
            notification_outbox_path: non_empty_path(lookup("NOTIFICATION_OUTBOX_PATH")),
            sla_policy_path: non_empty_path(lookup("SLA_POLICY_PATH")),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join(DB_FILE_NAME)
    }

    /// Default policies, overlaid with the policy file if one is configured.
    pub fn sla_policies(&self) -> Result<SlaPolicies> {
        let Some(path) = &self.sla_policy_path else {
            return Ok(SlaPolicies::default());
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read SLA policy file {}", path.display()))?;
        SlaPolicies::from_json(&json)
            .with_context(|| format!("invalid SLA policy file {}", path.display()))
    }
}

/// Blank values count as unset.
fn non_empty_path(value: Option<String>) -> Option<PathBuf> {
    value.filter(|s| !s.trim().is_empty()).map(PathBuf::from)
}
