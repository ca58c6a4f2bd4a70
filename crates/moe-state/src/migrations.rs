//! SurrealDB schema migrations and initialization
//!
//! Sets up the session, battle log and EMA tables with their indexes.

use crate::error::StoreError;
use crate::storage_traits::StoreResult;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all tracker tables in SurrealDB
///
/// Safe to call on every connection (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StoreResult<()> {
    info!("Initializing MoE tracker schema");

    init_sessions_table(db).await?;
    init_battles_table(db).await?;
    init_ema_table(db).await?;

    info!("MoE tracker schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, sql: &str) -> StoreResult<()> {
    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StoreError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `sessions` table
///
/// Schema:
/// ```text
/// TABLE sessions {
///   session_id:  STRING (unique)
///   tank_id:     INT
///   tank_name:   STRING
///   started_at:  DATETIME (indexed, latest session wins on load)
/// }
/// ```
async fn init_sessions_table(db: &Surreal<Any>) -> StoreResult<()> {
    debug!("Initializing sessions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS sessions SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_session_id ON TABLE sessions COLUMNS session_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_started_at ON TABLE sessions COLUMNS started_at;
    "#;

    run(db, sql).await?;
    info!("✓ sessions table initialized");
    Ok(())
}

/// Initialize `battles` table
///
/// Schema:
/// ```text
/// TABLE battles {
///   battle_id:         STRING (unique)
///   session_id:        STRING (indexed)
///   seq:               INT (1-based, unique per session)
///   combined_damage:   INT
///   estimated_damage:  INT
///   source:            STRING (estimated | corrected)
///   ended_at:          DATETIME
/// }
/// ```
///
/// Rows are never deleted. The estimated → corrected update is the only
/// permitted mutation (enforced in the store).
async fn init_battles_table(db: &Surreal<Any>) -> StoreResult<()> {
    debug!("Initializing battles table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS battles SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_battle_id ON TABLE battles COLUMNS battle_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_session_seq ON TABLE battles COLUMNS session_id, seq UNIQUE;
    "#;

    run(db, sql).await?;
    info!("✓ battles table initialized");
    Ok(())
}

/// Initialize `ema_state` table (single row `ema_state:current`)
async fn init_ema_table(db: &Surreal<Any>) -> StoreResult<()> {
    debug!("Initializing ema_state table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS ema_state SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;
    "#;

    run(db, sql).await?;
    info!("✓ ema_state table initialized");
    Ok(())
}
