//! Error types for moe-state

use thiserror::Error;

/// Errors that can occur in the session persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Backend write or query failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Session metadata not present
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Battle record not present in the log
    #[error("Battle not found: {battle_id}")]
    BattleNotFound { battle_id: String },

    /// A battle with this id was already appended
    #[error("Battle already recorded: {battle_id}")]
    DuplicateBattle { battle_id: String },

    /// Corrected records are immutable
    #[error("Battle {battle_id} was already corrected")]
    AlreadyCorrected { battle_id: String },

    /// Update payload does not describe the same battle
    #[error("Battle update mismatch for {battle_id}: {reason}")]
    InvalidUpdate { battle_id: String, reason: String },

    /// A stored value could not be mapped back into the domain model
    #[error("Corrupt record in {table}: {reason}")]
    CorruptRecord { table: String, reason: String },
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    /// Whether retrying the same write could succeed.
    ///
    /// Contract violations (duplicates, repeated corrections, unknown ids)
    /// will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Backend(_))
    }
}
