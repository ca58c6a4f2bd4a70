//! In-memory fake for the storage trait (testing only)
//!
//! `MemorySessionStore` satisfies the `SessionStore` contract without any
//! external dependencies, and can be told to fail writes so callers can
//! exercise their persistence-failure paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Inner {
    sessions: Vec<Session>,
    battles: Vec<BattleRecord>,
    ema: Option<(SessionId, EmaState)>,
}

/// In-memory session store backed by plain vectors.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StoreError::Backend` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current EMA record, if any.
    pub fn ema(&self) -> Option<EmaState> {
        let inner = self.inner.lock().unwrap();
        inner.ema.as_ref().map(|(_, state)| *state)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    fn acked(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> StoreResult<Option<StoredState>> {
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.last().cloned() else {
            return Ok(None);
        };
        let ema = inner
            .ema
            .as_ref()
            .filter(|(sid, _)| *sid == session.session_id)
            .map(|(_, state)| *state);
        let mut battles: Vec<BattleRecord> = inner
            .battles
            .iter()
            .filter(|b| b.session_id == session.session_id)
            .cloned()
            .collect();
        battles.sort_by_key(|b| b.seq);
        Ok(Some(StoredState {
            session,
            ema,
            battles,
        }))
    }

    async fn start_session(&self, session: &Session) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.push(session.clone());
        self.acked();
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session.session_id)
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session.session_id.0.clone(),
            })?;
        *existing = session.clone();
        self.acked();
        Ok(())
    }

    async fn append_battle(&self, record: &BattleRecord) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.battles.iter().any(|b| b.battle_id == record.battle_id) {
            return Err(StoreError::DuplicateBattle {
                battle_id: record.battle_id.0.clone(),
            });
        }
        inner.battles.push(record.clone());
        self.acked();
        Ok(())
    }

    async fn update_battle(
        &self,
        battle_id: &BattleId,
        record: &BattleRecord,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .battles
            .iter_mut()
            .find(|b| b.battle_id == *battle_id)
            .ok_or_else(|| StoreError::BattleNotFound {
                battle_id: battle_id.0.clone(),
            })?;
        validate_correction(existing, record)?;
        *existing = record.clone();
        self.acked();
        Ok(())
    }

    async fn save_ema(&self, session_id: &SessionId, state: &EmaState) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        inner.ema = Some((session_id.clone(), *state));
        self.acked();
        Ok(())
    }

    async fn battles(&self, session_id: &SessionId) -> StoreResult<Vec<BattleRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut battles: Vec<BattleRecord> = inner
            .battles
            .iter()
            .filter(|b| b.session_id == *session_id)
            .cloned()
            .collect();
        battles.sort_by_key(|b| b.seq);
        Ok(battles)
    }
}
