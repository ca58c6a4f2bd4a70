//! MoE Core Library
//!
//! Live Marks of Excellence tracking: battle detection over damage readings,
//! the EMA that drives the mark percentage, post-battle correction against
//! authoritative statistics, and the snapshot feed for overlays.

pub mod battle_detector;
pub mod broadcast;
pub mod calculator;
pub mod config;
pub mod correction;
pub mod ema;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod persist;
pub mod poller;
pub mod providers;
pub mod reading;
pub mod snapshot;
pub mod telemetry;
pub mod wargaming;

pub use battle_detector::{BattleDetector, BattleEvent, DetectorConfig, EndReason};
pub use broadcast::{StateBroadcaster, Subscription};
pub use calculator::{CorrectionOutcome, MoeCalculator, Phase, Transition};
pub use config::{TrackerConfig, MEMORY_STORE};
pub use correction::{
    fetch_with_retries, CorrectionCompletion, CorrectionCoordinator, CorrectionFailure,
    CorrectionPolicy, CorrectionRequest, CorrectionResult,
};
pub use ema::{BattlesToTarget, EmaCalculator, DEFAULT_ALPHA, MAX_PROJECTED_BATTLES};
pub use engine::{Engine, EngineCommand, EngineHandle, EngineStatus, TankSelection};
pub use error::{MoeError, ProviderError, Result};
pub use persist::{PersistPolicy, Persister, StoreWrite};
pub use poller::spawn_poller;
pub use providers::{
    resolve_target, CachedThresholdProvider, MoeThresholds, NullResultProvider, ResultProvider,
    ThresholdProvider,
};
pub use reading::{ChannelSource, DamageReading, DropReason, ReadingFilter, ReadingSource};
pub use snapshot::{moe_percent, MoeSnapshot, SnapshotStatus};
pub use telemetry::init_tracing;
pub use wargaming::{
    battle_delta, BattleDelta, Platform, TankStatsSnapshot, WargamingClient,
    WargamingResultProvider,
};

pub use moe_state::{
    BattleId, BattleRecord, BattleSource, EmaState, Session, SessionId, SessionStore,
    StoredState, SurrealSessionStore, TankId,
};
