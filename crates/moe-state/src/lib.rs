//! moe-state: durable state for the MoE tracker
//!
//! This crate provides the persistence layer for Marks of Excellence
//! tracking: the append-only battle log, the single EMA record and the
//! session metadata that scopes them.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durability before acknowledgement, and a log from which the EMA
//! can always be replayed.
//!
//! ## Key Components
//!
//! - `SessionStore`: the async storage contract
//! - `SurrealSessionStore`: SurrealDB implementation (`surrealkv://` on disk)
//! - `MemorySessionStore`: in-memory fake with write-failure injection

mod error;
pub mod fakes;
pub mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StoreError;
pub use storage_traits::{
    BattleId, BattleRecord, BattleSource, EmaState, Session, SessionId, SessionStore,
    StoreResult, StoredState, TankId,
};
pub use surreal_store::SurrealSessionStore;
