//! Boundaries to remote collaborators.
//!
//! - [`ResultProvider`]: the authoritative post-battle combined damage
//! - [`ThresholdProvider`]: the damage needed for the next mark
//!
//! The engine only ever sees these traits. [`crate::wargaming`] provides
//! the networked result provider; thresholds come from a local cache that
//! tolerates stale entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use moe_state::{Session, TankId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::correction::CorrectionRequest;
use crate::error::{ProviderError, Result};

/// Source of authoritative per-battle results.
#[async_trait]
pub trait ResultProvider: Send + Sync {
    /// Called when a session starts or resumes with `closed_battles` already
    /// in its log. Returns the server-side battle count the provider counts
    /// the session's battles from, if it keeps one.
    async fn prepare(
        &self,
        _session: &Session,
        _closed_battles: u32,
    ) -> std::result::Result<Option<u64>, ProviderError> {
        Ok(None)
    }

    /// Authoritative combined damage of the requested battle.
    async fn fetch(&self, request: &CorrectionRequest) -> std::result::Result<u64, ProviderError>;
}

/// Offline mode: no authoritative source, every estimate stands.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResultProvider;

#[async_trait]
impl ResultProvider for NullResultProvider {
    async fn fetch(&self, _request: &CorrectionRequest) -> std::result::Result<u64, ProviderError> {
        Err(ProviderError::Unavailable(
            "no authoritative result provider configured".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// How long cached thresholds count as fresh.
pub const THRESHOLD_TTL_HOURS: i64 = 24;

/// Combined damage needed for each mark on one tank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoeThresholds {
    pub tank_id: u64,
    pub tank_name: String,
    /// One mark (65th percentile).
    pub mark_65: f64,
    /// Two marks (85th percentile).
    pub mark_85: f64,
    /// Three marks (95th percentile).
    pub mark_95: f64,
    pub fetched_at: DateTime<Utc>,
}

impl MoeThresholds {
    /// Approximate all three marks from the one target the player knows.
    pub fn manual(tank_id: TankId, tank_name: impl Into<String>, target: f64) -> Self {
        Self {
            tank_id: tank_id.0,
            tank_name: tank_name.into(),
            mark_65: target * (65.0 / 95.0),
            mark_85: target * (85.0 / 95.0),
            mark_95: target,
            fetched_at: Utc::now(),
        }
    }

    /// Threshold of the next mark for a player who already has `marks_on_gun`.
    pub fn target_for_mark(&self, marks_on_gun: u8) -> f64 {
        match marks_on_gun {
            0 => self.mark_65,
            1 => self.mark_85,
            _ => self.mark_95,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.fetched_at > ttl
    }
}

#[async_trait]
pub trait ThresholdProvider: Send + Sync {
    /// Damage target for the tank; stale values are acceptable.
    async fn get_target(&self, tank_id: TankId) -> std::result::Result<Option<f64>, ProviderError>;
}

/// The configured override wins; otherwise ask the provider.
pub async fn resolve_target(
    override_target: Option<f64>,
    provider: &dyn ThresholdProvider,
    tank_id: TankId,
) -> Option<f64> {
    if let Some(target) = override_target.filter(|t| *t > 0.0) {
        return Some(target);
    }
    match provider.get_target(tank_id).await {
        Ok(target) => target,
        Err(err) => {
            warn!(tank_id = %tank_id, error = %err, "threshold lookup failed");
            None
        }
    }
}

/// Thresholds kept in memory and in a JSON file keyed by tank id.
pub struct CachedThresholdProvider {
    cache_file: PathBuf,
    ttl: Duration,
    marks_on_gun: u8,
    memory: Mutex<HashMap<u64, MoeThresholds>>,
}

impl CachedThresholdProvider {
    pub fn new(cache_file: impl Into<PathBuf>, marks_on_gun: u8) -> Self {
        Self {
            cache_file: cache_file.into(),
            ttl: Duration::hours(THRESHOLD_TTL_HOURS),
            marks_on_gun,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    /// Fresh thresholds only (memory first, then disk).
    pub async fn cached(&self, tank_id: TankId) -> Option<MoeThresholds> {
        let now = Utc::now();
        let mut memory = self.memory.lock().await;
        if let Some(hit) = memory.get(&tank_id.0) {
            if !hit.is_stale(now, self.ttl) {
                return Some(hit.clone());
            }
        }

        let disk = self.load_disk();
        let hit = disk.get(&tank_id.0.to_string())?;
        if hit.is_stale(now, self.ttl) {
            return None;
        }
        memory.insert(tank_id.0, hit.clone());
        Some(hit.clone())
    }

    /// Any thresholds we have, fresh or not.
    pub async fn thresholds(&self, tank_id: TankId) -> Option<MoeThresholds> {
        if let Some(fresh) = self.cached(tank_id).await {
            return Some(fresh);
        }
        let stale = self.load_disk().remove(&tank_id.0.to_string())?;
        warn!(tank_id = %tank_id, fetched_at = %stale.fetched_at, "using stale threshold cache");
        Some(stale)
    }

    /// Record a player-supplied target and persist it.
    pub async fn set_manual(
        &self,
        tank_id: TankId,
        tank_name: &str,
        target: f64,
    ) -> Result<MoeThresholds> {
        let thresholds = MoeThresholds::manual(tank_id, tank_name, target);
        self.store(thresholds.clone()).await?;
        Ok(thresholds)
    }

    async fn store(&self, thresholds: MoeThresholds) -> Result<()> {
        let mut memory = self.memory.lock().await;
        let mut disk = self.load_disk();
        disk.insert(thresholds.tank_id.to_string(), thresholds.clone());
        memory.insert(thresholds.tank_id, thresholds);

        if let Some(parent) = self.cache_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.cache_file, serde_json::to_string_pretty(&disk)?)?;
        debug!(path = %self.cache_file.display(), entries = disk.len(), "threshold cache written");
        Ok(())
    }

    fn load_disk(&self) -> HashMap<String, MoeThresholds> {
        let Ok(text) = std::fs::read_to_string(&self.cache_file) else {
            return HashMap::new();
        };
        match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.cache_file.display(), error = %err, "corrupt threshold cache, ignoring");
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl ThresholdProvider for CachedThresholdProvider {
    async fn get_target(&self, tank_id: TankId) -> std::result::Result<Option<f64>, ProviderError> {
        Ok(self
            .thresholds(tank_id)
            .await
            .map(|t| t.target_for_mark(self.marks_on_gun)))
    }
}
