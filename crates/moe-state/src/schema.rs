//! Row definitions for the MoE tracker SurrealDB tables
//!
//! Tables:
//! - sessions: one row per tracking session
//! - battles: the append-only battle log
//! - ema_state: a single overwritten row holding the current EMA
//!
//! Rows convert to and from the `storage_traits` types at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::storage_traits::{
    BattleId, BattleRecord, BattleSource, EmaState, Session, SessionId, StoreResult, TankId,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Same as `surreal_datetime`, for optional timestamps
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = date.map(SurrealDatetime::from);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Session row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub session_id: String,
    pub tank_id: u64,
    pub tank_name: String,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub seed_average: Option<f64>,
    #[serde(default)]
    pub stats_baseline: Option<u64>,
}

impl From<&Session> for SessionRow {
    fn from(session: &Session) -> Self {
        SessionRow {
            id: None,
            session_id: session.session_id.0.clone(),
            tank_id: session.tank_id.0,
            tank_name: session.tank_name.clone(),
            started_at: session.started_at,
            seed_average: session.seed_average,
            stats_baseline: session.stats_baseline,
        }
    }
}

impl SessionRow {
    pub fn into_session(self) -> Session {
        Session {
            session_id: SessionId(self.session_id),
            started_at: self.started_at,
            tank_id: TankId(self.tank_id),
            tank_name: self.tank_name,
            seed_average: self.seed_average,
            stats_baseline: self.stats_baseline,
        }
    }
}

/// Battle log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub battle_id: String,
    pub session_id: String,
    pub seq: u32,
    pub combined_damage: u64,
    pub estimated_damage: u64,
    /// "estimated" | "corrected"
    pub source: String,
    #[serde(with = "surreal_datetime")]
    pub ended_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub corrected_at: Option<DateTime<Utc>>,
}

impl From<&BattleRecord> for BattleRow {
    fn from(record: &BattleRecord) -> Self {
        BattleRow {
            id: None,
            battle_id: record.battle_id.0.clone(),
            session_id: record.session_id.0.clone(),
            seq: record.seq,
            combined_damage: record.combined_damage,
            estimated_damage: record.estimated_damage,
            source: record.source.as_str().to_string(),
            ended_at: record.ended_at,
            corrected_at: record.corrected_at,
        }
    }
}

impl BattleRow {
    pub fn into_record(self) -> StoreResult<BattleRecord> {
        let source: BattleSource = self.source.parse()?;
        Ok(BattleRecord {
            battle_id: BattleId(self.battle_id),
            session_id: SessionId(self.session_id),
            seq: self.seq,
            combined_damage: self.combined_damage,
            estimated_damage: self.estimated_damage,
            ended_at: self.ended_at,
            source,
            corrected_at: self.corrected_at,
        })
    }
}

/// The single EMA row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub session_id: String,
    pub average: f64,
    pub battle_count: u64,
    pub alpha: f64,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl EmaRow {
    pub fn new(session_id: &SessionId, state: &EmaState) -> Self {
        EmaRow {
            id: None,
            session_id: session_id.0.clone(),
            average: state.average,
            battle_count: state.battle_count,
            alpha: state.alpha,
            updated_at: Utc::now(),
        }
    }

    pub fn into_state(self) -> StoreResult<EmaState> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(StoreError::CorruptRecord {
                table: "ema_state".to_string(),
                reason: format!("alpha out of range: {}", self.alpha),
            });
        }
        Ok(EmaState {
            average: self.average,
            battle_count: self.battle_count,
            alpha: self.alpha,
        })
    }
}
