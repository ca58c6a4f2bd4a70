//! SurrealDB-backed SessionStore implementation
//!
//! Uses the `schema` rows for persistence, converting to/from
//! `storage_traits` types at the boundary. `surrealkv://` gives a durable
//! on-disk store; `mem://` is used by tests.

use std::path::Path;

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::migrations;
use crate::schema::{BattleRow, EmaRow, SessionRow};
use crate::storage_traits::{
    validate_correction, BattleId, BattleRecord, BattleSource, EmaState, Session, SessionId,
    SessionStore, StoreResult, StoredState,
};

const NAMESPACE: &str = "moe";
const DATABASE: &str = "tracker";

/// SurrealDB-backed implementation of [`SessionStore`].
#[derive(Clone)]
pub struct SurrealSessionStore {
    db: Surreal<Any>,
}

impl SurrealSessionStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StoreResult<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealSessionStore connected (in-memory)");
        Ok(store)
    }

    /// Open (or create) a durable store in the given directory.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StoreError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        let store = Self::connect(&url).await?;
        info!("SurrealSessionStore connected ({})", url);
        Ok(store)
    }

    /// Connect to any SurrealDB endpoint URL and initialise the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_battle(&self, battle_id: &BattleId) -> StoreResult<Option<BattleRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM battles WHERE battle_id = $bid")
            .bind(("bid", battle_id.0.clone()))
            .await?;
        let rows: Vec<BattleRow> = res.take(0)?;
        rows.into_iter().next().map(BattleRow::into_record).transpose()
    }

    async fn latest_session(&self) -> StoreResult<Option<Session>> {
        let mut res = self
            .db
            .query("SELECT * FROM sessions ORDER BY started_at DESC LIMIT 1")
            .await?;
        let rows: Vec<SessionRow> = res.take(0)?;
        Ok(rows.into_iter().next().map(SessionRow::into_session))
    }
}

#[async_trait]
impl SessionStore for SurrealSessionStore {
    async fn load(&self) -> StoreResult<Option<StoredState>> {
        let Some(session) = self.latest_session().await? else {
            return Ok(None);
        };

        let row: Option<EmaRow> = self.db.select(("ema_state", "current")).await?;
        let ema = match row {
            Some(row) if row.session_id == session.session_id.0 => Some(row.into_state()?),
            _ => None,
        };

        let battles = self.battles(&session.session_id).await?;
        debug!(
            session_id = %session.session_id,
            battles = battles.len(),
            "loaded session state"
        );
        Ok(Some(StoredState {
            session,
            ema,
            battles,
        }))
    }

    async fn start_session(&self, session: &Session) -> StoreResult<()> {
        debug!(session_id = %session.session_id, tank_id = %session.tank_id, "starting session");
        let _created: Option<SessionRow> = self
            .db
            .create("sessions")
            .content(SessionRow::from(session))
            .await?;
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> StoreResult<()> {
        debug!(session_id = %session.session_id, "updating session");
        let mut res = self
            .db
            .query(
                "UPDATE sessions SET tank_name = $name, seed_average = $seed, \
                 stats_baseline = $baseline WHERE session_id = $sid",
            )
            .bind(("name", session.tank_name.clone()))
            .bind(("seed", session.seed_average))
            .bind(("baseline", session.stats_baseline))
            .bind(("sid", session.session_id.0.clone()))
            .await?
            .check()?;
        let updated: Vec<SessionRow> = res.take(0)?;
        if updated.is_empty() {
            return Err(StoreError::SessionNotFound {
                session_id: session.session_id.0.clone(),
            });
        }
        Ok(())
    }

    async fn append_battle(&self, record: &BattleRecord) -> StoreResult<()> {
        if self.fetch_battle(&record.battle_id).await?.is_some() {
            return Err(StoreError::DuplicateBattle {
                battle_id: record.battle_id.0.clone(),
            });
        }

        debug!(battle_id = %record.battle_id, seq = record.seq, "appending battle");
        let _created: Option<BattleRow> = self
            .db
            .create("battles")
            .content(BattleRow::from(record))
            .await?;
        Ok(())
    }

    async fn update_battle(
        &self,
        battle_id: &BattleId,
        record: &BattleRecord,
    ) -> StoreResult<()> {
        let existing = self
            .fetch_battle(battle_id)
            .await?
            .ok_or_else(|| StoreError::BattleNotFound {
                battle_id: battle_id.0.clone(),
            })?;
        validate_correction(&existing, record)?;

        debug!(battle_id = %battle_id, damage = record.combined_damage, "correcting battle");
        self.db
            .query(
                "UPDATE battles SET combined_damage = $dmg, source = $src, \
                 corrected_at = $at WHERE battle_id = $bid AND source = $estimated",
            )
            .bind(("dmg", record.combined_damage))
            .bind(("at", record.corrected_at.map(surrealdb::sql::Datetime::from)))
            .bind(("src", BattleSource::Corrected.as_str().to_string()))
            .bind(("estimated", BattleSource::Estimated.as_str().to_string()))
            .bind(("bid", battle_id.0.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn save_ema(&self, session_id: &SessionId, state: &EmaState) -> StoreResult<()> {
        self.db
            .query("UPSERT ema_state:current CONTENT $row")
            .bind(("row", EmaRow::new(session_id, state)))
            .await?
            .check()?;
        Ok(())
    }

    async fn battles(&self, session_id: &SessionId) -> StoreResult<Vec<BattleRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM battles WHERE session_id = $sid ORDER BY seq ASC")
            .bind(("sid", session_id.0.clone()))
            .await?;
        let rows: Vec<BattleRow> = res.take(0)?;
        rows.into_iter().map(BattleRow::into_record).collect()
    }
}
