//! Ordered write-behind persistence.
//!
//! The engine never awaits the store while processing readings. Instead it
//! enqueues [`StoreWrite`]s into a FIFO that a dedicated task applies one at
//! a time. Transient failures are retried with capped exponential backoff;
//! the queue does not move past a failing write, so ordering is preserved.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moe_state::{BattleRecord, EmaState, Session, SessionId, SessionStore, StoreResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics::METRICS;
use crate::obs;

/// One durable mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    StartSession(Session),
    UpdateSession(Session),
    AppendBattle(BattleRecord),
    UpdateBattle(BattleRecord),
    SaveEma {
        session_id: SessionId,
        state: EmaState,
    },
}

impl StoreWrite {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreWrite::StartSession(_) => "start_session",
            StoreWrite::UpdateSession(_) => "update_session",
            StoreWrite::AppendBattle(_) => "append_battle",
            StoreWrite::UpdateBattle(_) => "update_battle",
            StoreWrite::SaveEma { .. } => "save_ema",
        }
    }

    pub async fn apply(&self, store: &dyn SessionStore) -> StoreResult<()> {
        match self {
            StoreWrite::StartSession(session) => store.start_session(session).await,
            StoreWrite::UpdateSession(session) => store.update_session(session).await,
            StoreWrite::AppendBattle(record) => store.append_battle(record).await,
            StoreWrite::UpdateBattle(record) => {
                store.update_battle(&record.battle_id, record).await
            }
            StoreWrite::SaveEma { session_id, state } => store.save_ema(session_id, state).await,
        }
    }
}

/// Retry pacing for failed writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistPolicy {
    /// First retry delay (milliseconds); doubles per attempt.
    pub retry_base_ms: u64,
    /// Upper bound on the retry delay (milliseconds).
    pub retry_max_ms: u64,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            retry_base_ms: 100,
            retry_max_ms: 5_000,
        }
    }
}

impl PersistPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor).min(self.retry_max_ms))
    }
}

enum PersistCommand {
    Write(StoreWrite),
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence task.
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistCommand>,
    pending: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Persister {
    pub fn spawn(store: Arc<dyn SessionStore>, policy: PersistPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicU64::new(0));
        let degraded = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_writer(
            store,
            policy,
            rx,
            pending.clone(),
            degraded.clone(),
        ));
        Self {
            tx,
            pending,
            degraded,
            task,
        }
    }

    /// Queue a write. Never blocks.
    pub fn enqueue(&self, write: StoreWrite) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(PersistCommand::Write(write)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("persistence task is gone, dropping write");
        }
    }

    /// Writes queued or in progress.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// `true` while the most recent write attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Wait until every write queued so far is durable, up to `timeout`.
    ///
    /// Returns `false` if the queue did not drain in time.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, ack_rx).await, Ok(Ok(())))
    }

    /// Stop accepting writes and wait (bounded) for the queue to drain.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let Persister { tx, mut task, .. } = self;
        drop(tx);
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("persistence queue did not drain before shutdown");
                task.abort();
                false
            }
        }
    }
}

async fn run_writer(
    store: Arc<dyn SessionStore>,
    policy: PersistPolicy,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    pending: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Write(write) => {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match write.apply(store.as_ref()).await {
                        Ok(()) => {
                            degraded.store(false, Ordering::SeqCst);
                            debug!(kind = write.kind(), attempt, "write persisted");
                            break;
                        }
                        Err(err) if err.is_transient() => {
                            degraded.store(true, Ordering::SeqCst);
                            METRICS.inc_persistence_failures();
                            obs::emit_persistence_failure(write.kind(), attempt, &err);
                            tokio::time::sleep(policy.delay(attempt)).await;
                        }
                        Err(err) => {
                            // Retrying cannot help; the write contradicts what is stored.
                            METRICS.inc_persistence_failures();
                            obs::emit_persistence_rejected(write.kind(), &err);
                            break;
                        }
                    }
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            PersistCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use moe_state::fakes::MemorySessionStore;
    use moe_state::{BattleId, TankId};

    fn record(session: &Session, seq: u32, damage: u64) -> BattleRecord {
        BattleRecord::estimated(
            BattleId::new(),
            session.session_id.clone(),
            seq,
            damage,
            Utc::now(),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = PersistPolicy {
            retry_base_ms: 100,
            retry_max_ms: 500,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn writes_apply_in_order() {
        let store = Arc::new(MemorySessionStore::new());
        let persister = Persister::spawn(store.clone(), PersistPolicy::default());
        let session = Session::new(TankId(42), "T-54");

        persister.enqueue(StoreWrite::StartSession(session.clone()));
        let first = record(&session, 1, 820);
        persister.enqueue(StoreWrite::AppendBattle(first.clone()));
        persister.enqueue(StoreWrite::UpdateBattle(first.corrected(600, Utc::now())));

        assert!(persister.flush(Duration::from_secs(5)).await);
        assert_eq!(persister.pending(), 0);
        let log = store.battles(&session.session_id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].combined_damage, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_until_store_recovers() {
        let store = Arc::new(MemorySessionStore::new());
        let persister = Persister::spawn(store.clone(), PersistPolicy::default());
        let session = Session::new(TankId(42), "T-54");

        store.set_fail_writes(true);
        persister.enqueue(StoreWrite::StartSession(session.clone()));
        assert!(!persister.flush(Duration::from_secs(2)).await);
        assert!(persister.is_degraded());
        assert_eq!(persister.pending(), 1);

        store.set_fail_writes(false);
        assert!(persister.flush(Duration::from_secs(30)).await);
        assert!(!persister.is_degraded());
        assert_eq!(store.load().await.unwrap().unwrap().session, session);
    }

    #[tokio::test]
    async fn rejected_write_does_not_block_queue() {
        let store = Arc::new(MemorySessionStore::new());
        let persister = Persister::spawn(store.clone(), PersistPolicy::default());
        let session = Session::new(TankId(42), "T-54");
        let battle = record(&session, 1, 820);

        persister.enqueue(StoreWrite::StartSession(session.clone()));
        persister.enqueue(StoreWrite::AppendBattle(battle.clone()));
        persister.enqueue(StoreWrite::AppendBattle(battle.clone()));
        persister.enqueue(StoreWrite::SaveEma {
            session_id: session.session_id.clone(),
            state: EmaState {
                average: 820.0,
                battle_count: 1,
                alpha: 0.3,
            },
        });

        assert!(persister.flush(Duration::from_secs(5)).await);
        assert_eq!(store.ema().map(|s| s.average), Some(820.0));
    }

    #[tokio::test]
    async fn shutdown_drains_queue() {
        let store = Arc::new(MemorySessionStore::new());
        let persister = Persister::spawn(store.clone(), PersistPolicy::default());
        let session = Session::new(TankId(7), "IS-7");
        persister.enqueue(StoreWrite::StartSession(session.clone()));

        assert!(persister.shutdown(Duration::from_secs(5)).await);
        assert!(store.load().await.unwrap().is_some());
    }
}
