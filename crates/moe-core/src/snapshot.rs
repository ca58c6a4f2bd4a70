//! The externally visible tracker state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    #[default]
    Idle,
    InBattle,
    /// The last finished battle now carries its authoritative value.
    Corrected,
}

/// One live-update message. Every published snapshot is self-consistent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MoeSnapshot {
    pub tank_name: String,
    pub moe_percent: f64,
    pub projected_moe_percent: f64,
    pub combined_damage: u64,
    /// Change of `moe_percent` caused by the transition that produced this snapshot.
    pub delta: f64,
    pub in_battle: bool,
    pub status: SnapshotStatus,
}

impl MoeSnapshot {
    pub fn idle(tank_name: impl Into<String>) -> Self {
        Self {
            tank_name: tank_name.into(),
            ..Self::default()
        }
    }
}

/// `100 * average / target`, clamped to `[0, 100]`. A non-positive target yields 0.
pub fn moe_percent(average: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 0.0;
    }
    (100.0 * average / target).clamp(0.0, 100.0)
}
