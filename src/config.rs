use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_COMMAND: &str = "claude -p";

/// Floor for every timer period; `tokio::time::interval` rejects zero.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Clamp a configured timer period to [`MIN_INTERVAL`].
pub fn timer_period(period: Duration) -> Duration {
    period.max(MIN_INTERVAL)
}

/// Thresholds for the cleanup scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Agents without a heartbeat for this long are considered stale.
    pub agent_stale_minutes: u64,
    /// Channels idle this long with no active participant are closed.
    pub room_inactive_minutes: u64,
    /// Interval between periodic sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            agent_stale_minutes: 30,
            room_inactive_minutes: 60,
            sweep_interval_secs: 300,
        }
    }
}

impl CleanupConfig {
    pub fn sweep_interval(&self) -> Duration {
        timer_period(Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Defaults for dependency waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaiterConfig {
    pub default_timeout_secs: u64,
    /// Backstop re-read interval in case an event is missed.
    pub poll_interval_ms: u64,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 1800,
            poll_interval_ms: 1500,
        }
    }
}

impl WaiterConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        timer_period(Duration::from_millis(self.poll_interval_ms))
    }
}

/// Orchestration run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the monitoring phase.
    pub max_run_minutes: u64,
    pub monitor_poll_ms: u64,
    /// Capability tier used when classification is unavailable.
    pub default_tier: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_run_minutes: 120,
            monitor_poll_ms: 2000,
            default_tier: "standard".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_minutes * 60)
    }

    pub fn monitor_poll(&self) -> Duration {
        timer_period(Duration::from_millis(self.monitor_poll_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent executable and leading arguments.
    pub command: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub waiter: WaiterConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Store snapshot location.
    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("state.json"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(&path)?)
    }

    /// Parse TOML, filling in defaults for missing sections.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        debug!(
            command = ?config.command,
            stale_minutes = config.cleanup.agent_stale_minutes,
            room_minutes = config.cleanup.room_inactive_minutes,
            "config loaded"
        );
        Ok(config)
    }

    /// Reject settings that cannot drive a timer.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("waiter.poll_interval_ms", self.waiter.poll_interval_ms),
            ("engine.monitor_poll_ms", self.engine.monitor_poll_ms),
            ("cleanup.sweep_interval_secs", self.cleanup.sweep_interval_secs),
        ];
        for (key, value) in periods {
            if value == 0 {
                return Err(Error::Validation(format!("{} must be greater than zero", key)));
            }
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating conductor directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
