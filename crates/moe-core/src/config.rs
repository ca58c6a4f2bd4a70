//! Tracker configuration.
//!
//! Loaded from a TOML file; every section and key is optional. A few values
//! can be overridden from the environment so secrets stay out of the file:
//!
//! | Variable             | Overrides                |
//! |----------------------|--------------------------|
//! | `MOE_APPLICATION_ID` | `api.application_id`     |
//! | `MOE_DB_PATH`        | `store.path`             |
//! | `MOE_BIND`           | `server.bind`            |
//! | `MOE_TARGET_DAMAGE`  | `player.target_damage`   |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::battle_detector::DetectorConfig;
use crate::correction::CorrectionPolicy;
use crate::ema::{EmaCalculator, DEFAULT_ALPHA};
use crate::error::{MoeError, Result};
use crate::persist::PersistPolicy;
use crate::wargaming::Platform;

/// `store.path` value selecting the volatile in-memory store.
pub const MEMORY_STORE: &str = "mem";

/// Slowest accepted sampling rate (one reading every ~17 minutes).
pub const MIN_SAMPLE_RATE_HZ: f64 = 0.001;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub tracking: TrackingConfig,
    pub correction: CorrectionPolicy,
    pub persistence: PersistPolicy,
    pub player: PlayerConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Reading samples per second.
    pub sample_rate_hz: f64,
    /// Readings below this recognition confidence are dropped.
    pub min_confidence: f64,
    /// An active battle with no readings for this long is closed.
    pub staleness_ms: u64,
    pub zero_readings_to_end: u32,
    pub ema_alpha: f64,
    /// How long a battle end waits for queued writes before publishing.
    pub flush_timeout_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 2.0,
            min_confidence: 0.8,
            staleness_ms: 60_000,
            zero_readings_to_end: 1,
            ema_alpha: DEFAULT_ALPHA,
            flush_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub gamertag: Option<String>,
    pub tank_id: u64,
    /// Display name; looked up from the encyclopedia when unset.
    pub tank_name: Option<String>,
    /// Damage target override; wins over cached thresholds.
    pub target_damage: Option<f64>,
    /// Marks already on the gun; picks which threshold is the target.
    pub marks_on_gun: u8,
    /// Mark percentage from the service record; new sessions start here.
    pub current_moe_percent: Option<f64>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            gamertag: None,
            tank_id: 0,
            tank_name: None,
            target_damage: None,
            marks_on_gun: 2,
            current_moe_percent: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub application_id: Option<String>,
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SurrealKV directory, or `mem`.
    pub path: String,
    pub threshold_cache: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "moe-tracker.db".into(),
            threshold_cache: PathBuf::from("moe-thresholds.json"),
        }
    }
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_STORE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the live snapshot feed.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5174".into(),
        }
    }
}

impl TrackerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment, in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("MOE_APPLICATION_ID").filter(|v| !v.is_empty()) {
            self.api.application_id = Some(id);
        }
        if let Some(path) = lookup("MOE_DB_PATH").filter(|v| !v.is_empty()) {
            self.store.path = path;
        }
        if let Some(bind) = lookup("MOE_BIND").filter(|v| !v.is_empty()) {
            self.server.bind = bind;
        }
        if let Some(target) = lookup("MOE_TARGET_DAMAGE").filter(|v| !v.is_empty()) {
            let parsed = target.parse::<f64>().map_err(|_| {
                MoeError::InvalidConfig(format!("MOE_TARGET_DAMAGE is not a number: {}", target))
            })?;
            self.player.target_damage = Some(parsed);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        EmaCalculator::new(self.tracking.ema_alpha)?;
        let t = &self.tracking;
        if !(t.sample_rate_hz >= MIN_SAMPLE_RATE_HZ && t.sample_rate_hz.is_finite()) {
            return Err(MoeError::InvalidConfig(format!(
                "tracking.sample_rate_hz must be at least {}, got {}",
                MIN_SAMPLE_RATE_HZ, t.sample_rate_hz
            )));
        }
        if !(0.0..=1.0).contains(&t.min_confidence) {
            return Err(MoeError::InvalidConfig(format!(
                "tracking.min_confidence must lie in [0, 1], got {}",
                t.min_confidence
            )));
        }
        if t.staleness_ms == 0 {
            return Err(MoeError::InvalidConfig(
                "tracking.staleness_ms must be positive".into(),
            ));
        }
        if t.zero_readings_to_end == 0 {
            return Err(MoeError::InvalidConfig(
                "tracking.zero_readings_to_end must be at least 1".into(),
            ));
        }
        if let Some(target) = self.player.target_damage {
            if target < 0.0 || !target.is_finite() {
                return Err(MoeError::InvalidConfig(format!(
                    "player.target_damage must be a non-negative number, got {}",
                    target
                )));
            }
        }
        if let Some(percent) = self.player.current_moe_percent {
            if !(0.0..=100.0).contains(&percent) {
                return Err(MoeError::InvalidConfig(format!(
                    "player.current_moe_percent must lie in [0, 100], got {}",
                    percent
                )));
            }
        }
        if self.correction.timeout_ms == 0 {
            return Err(MoeError::InvalidConfig(
                "correction.timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn ema(&self) -> Result<EmaCalculator> {
        EmaCalculator::new(self.tracking.ema_alpha)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            staleness: Duration::from_millis(self.tracking.staleness_ms),
            zero_readings_to_end: self.tracking.zero_readings_to_end,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tracking.sample_rate_hz)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.tracking.flush_timeout_ms)
    }
}
