//! Storage trait definitions for the MoE tracker
//!
//! The durable contract consists of:
//! - the append-only battle log (one `BattleRecord` per completed battle)
//! - a single EMA state record, overwritten after every change
//! - session metadata (which tank the log belongs to)
//!
//! The EMA record is a derived cache: replaying the battle log must always
//! reproduce it. In-memory fakes are provided for testing via the `fakes`
//! module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque identifier of a completed (or in-progress) battle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BattleId(pub String);

impl BattleId {
    /// Generate a new random BattleId
    pub fn new() -> Self {
        BattleId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BattleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BattleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a tracking session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random SessionId
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric vehicle identifier as used by the game API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TankId(pub u64);

impl std::fmt::Display for TankId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Battle log
// ---------------------------------------------------------------------------

/// Where a battle's damage value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BattleSource {
    /// Local observation, pending or without authoritative confirmation
    Estimated,
    /// Replaced by the authoritative server value; immutable from now on
    Corrected,
}

impl BattleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleSource::Estimated => "estimated",
            BattleSource::Corrected => "corrected",
        }
    }
}

impl std::str::FromStr for BattleSource {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "estimated" => Ok(BattleSource::Estimated),
            "corrected" => Ok(BattleSource::Corrected),
            other => Err(StoreError::CorruptRecord {
                table: "battles".to_string(),
                reason: format!("unknown battle source: {other}"),
            }),
        }
    }
}

/// One completed battle in a session's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleRecord {
    pub battle_id: BattleId,
    pub session_id: SessionId,
    /// 1-based position in the session log
    pub seq: u32,
    /// Damage value counted by the EMA (estimate, or authoritative once corrected)
    pub combined_damage: u64,
    /// The locally observed value, kept for audit after a correction
    pub estimated_damage: u64,
    pub ended_at: DateTime<Utc>,
    pub source: BattleSource,
    /// When the authoritative value was applied
    #[serde(default)]
    pub corrected_at: Option<DateTime<Utc>>,
}

impl BattleRecord {
    /// Create a freshly closed battle carrying the local estimate
    pub fn estimated(
        battle_id: BattleId,
        session_id: SessionId,
        seq: u32,
        damage: u64,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            battle_id,
            session_id,
            seq,
            combined_damage: damage,
            estimated_damage: damage,
            ended_at,
            source: BattleSource::Estimated,
            corrected_at: None,
        }
    }

    /// Copy of this record with the authoritative value applied
    pub fn corrected(&self, authoritative_damage: u64, at: DateTime<Utc>) -> Self {
        Self {
            combined_damage: authoritative_damage,
            source: BattleSource::Corrected,
            corrected_at: Some(at),
            ..self.clone()
        }
    }

    pub fn is_corrected(&self) -> bool {
        self.source == BattleSource::Corrected
    }
}

/// Check that `update` is a legal in-place correction of `existing`.
///
/// Only estimated → corrected is allowed, and identity fields must not move.
pub(crate) fn validate_correction(
    existing: &BattleRecord,
    update: &BattleRecord,
) -> StoreResult<()> {
    let battle_id = existing.battle_id.0.clone();
    if existing.is_corrected() {
        return Err(StoreError::AlreadyCorrected { battle_id });
    }
    if update.battle_id != existing.battle_id
        || update.session_id != existing.session_id
        || update.seq != existing.seq
    {
        return Err(StoreError::InvalidUpdate {
            battle_id,
            reason: "identity fields differ".to_string(),
        });
    }
    if !update.is_corrected() {
        return Err(StoreError::InvalidUpdate {
            battle_id,
            reason: "update must mark the battle corrected".to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// EMA state and sessions
// ---------------------------------------------------------------------------

/// Persisted exponential moving average over per-battle combined damage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub average: f64,
    pub battle_count: u64,
    pub alpha: f64,
}

impl EmaState {
    /// State with no battles folded in yet
    pub fn empty(alpha: f64) -> Self {
        Self {
            average: 0.0,
            battle_count: 0,
            alpha,
        }
    }
}

/// A tracking session: one tank, from selection until the next switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub tank_id: TankId,
    pub tank_name: String,
    /// Average the EMA starts from instead of the first battle, when the
    /// player's mark percentage was known at session start
    #[serde(default)]
    pub seed_average: Option<f64>,
    /// Server-side battle count of the tank before this session's first battle
    #[serde(default)]
    pub stats_baseline: Option<u64>,
}

impl Session {
    pub fn new(tank_id: TankId, tank_name: impl Into<String>) -> Self {
        Self {
            session_id: SessionId::new(),
            started_at: Utc::now(),
            tank_id,
            tank_name: tank_name.into(),
            seed_average: None,
            stats_baseline: None,
        }
    }

    pub fn with_seed_average(mut self, seed_average: Option<f64>) -> Self {
        self.seed_average = seed_average;
        self
    }
}

/// Everything `load` recovers for the most recent session
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub session: Session,
    /// `None` until the first EMA write for this session
    pub ema: Option<EmaState>,
    /// Battle log ordered by `seq`
    pub battles: Vec<BattleRecord>,
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Durable store for sessions, the battle log and EMA state.
///
/// Guarantees:
/// - A write returns `Ok` only once it is durable.
/// - Battle records are never deleted; `update_battle` succeeds at most once
///   per battle (estimated → corrected).
/// - `load` returns the most recently started session with its log ordered
///   by `seq`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Recover the latest session, its EMA record and its battle log.
    async fn load(&self) -> StoreResult<Option<StoredState>>;

    /// Persist session metadata. The session becomes the one `load` returns.
    async fn start_session(&self, session: &Session) -> StoreResult<()>;

    /// Overwrite the metadata of an already started session.
    async fn update_session(&self, session: &Session) -> StoreResult<()>;

    /// Append a completed battle. Fails on a duplicate `battle_id`.
    async fn append_battle(&self, record: &BattleRecord) -> StoreResult<()>;

    /// Replace an estimated record with its corrected version.
    async fn update_battle(&self, battle_id: &BattleId, record: &BattleRecord)
        -> StoreResult<()>;

    /// Overwrite the single EMA record.
    async fn save_ema(&self, session_id: &SessionId, state: &EmaState) -> StoreResult<()>;

    /// Battle log of one session ordered by `seq`.
    async fn battles(&self, session_id: &SessionId) -> StoreResult<Vec<BattleRecord>>;

    /// Create and persist a new session for the given tank.
    async fn new_session(&self, tank_id: TankId, tank_name: &str) -> StoreResult<Session> {
        let session = Session::new(tank_id, tank_name);
        self.start_session(&session).await?;
        Ok(session)
    }
}
