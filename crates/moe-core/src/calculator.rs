//! MoE calculator: the orchestrating state machine.
//!
//! Consumes battle events and correction results, keeps the session's battle
//! log and EMA in memory, and produces a fresh [`MoeSnapshot`] on every
//! state change. It performs no I/O: each call returns a [`Transition`]
//! describing what the engine should persist, schedule and publish.
//!
//! ```text
//! Idle/Corrected --Started--> InBattle --Ended--> AwaitingCorrection
//! AwaitingCorrection --correction ok--> Corrected
//! AwaitingCorrection --correction failed--> Idle
//! ```

use chrono::{DateTime, Utc};
use moe_state::{BattleId, BattleRecord, EmaState, Session, StoredState};
use tracing::{info, warn};

use crate::correction::CorrectionRequest;
use crate::ema::EmaCalculator;
use crate::persist::StoreWrite;
use crate::snapshot::{moe_percent, MoeSnapshot, SnapshotStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    InBattle { battle_id: BattleId },
    AwaitingCorrection { battle_id: BattleId },
    /// Resting state after a correction; behaves like `Idle`.
    Corrected,
}

/// What a state change asks the engine to do.
#[derive(Debug, Default)]
pub struct Transition {
    /// Snapshot to publish, if the visible state changed.
    pub snapshot: Option<MoeSnapshot>,
    /// Writes to enqueue, in order.
    pub writes: Vec<StoreWrite>,
    /// Correction to schedule.
    pub correction: Option<CorrectionRequest>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.writes.is_empty() && self.correction.is_none()
    }
}

/// How an authoritative value was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOutcome {
    Applied,
    /// The battle was already corrected; nothing changed.
    Duplicate,
    /// The battle is not part of the current session.
    Stale,
}

pub struct MoeCalculator {
    ema: EmaCalculator,
    session: Session,
    target: f64,
    state: EmaState,
    log: Vec<BattleRecord>,
    phase: Phase,
    live_damage: u64,
    snapshot: MoeSnapshot,
}

impl MoeCalculator {
    /// Start tracking a session with no battles yet. A session seed shows
    /// up as the starting percentage.
    pub fn new(ema: EmaCalculator, session: Session, target: f64) -> Self {
        let snapshot = MoeSnapshot::idle(session.tank_name.clone());
        let mut calculator = Self {
            state: ema.start(session.seed_average),
            ema,
            session,
            target,
            log: Vec::new(),
            phase: Phase::Idle,
            live_damage: 0,
            snapshot,
        };
        calculator.snapshot = calculator.compose(SnapshotStatus::Idle, 0, 0.0);
        calculator
    }

    /// Rebuild from durable state.
    ///
    /// The EMA is always replayed from the log. If the stored EMA record
    /// disagrees (or was written with another alpha), the returned write
    /// repairs it.
    pub fn restore(ema: EmaCalculator, stored: StoredState, target: f64) -> (Self, Option<StoreWrite>) {
        let StoredState {
            session,
            ema: stored_ema,
            battles,
        } = stored;

        let mut calculator = Self::new(ema, session, target);
        calculator.log = battles;
        calculator.state = calculator.replay_log();

        let repair = match stored_ema {
            Some(saved) if saved.alpha != ema.alpha() => {
                info!(
                    session_id = %calculator.session.session_id,
                    stored_alpha = saved.alpha,
                    alpha = ema.alpha(),
                    "EMA alpha changed, rebuilding from battle log"
                );
                true
            }
            Some(saved) if !same_state(&saved, &calculator.state) => {
                warn!(
                    session_id = %calculator.session.session_id,
                    stored_average = saved.average,
                    replayed_average = calculator.state.average,
                    stored_count = saved.battle_count,
                    replayed_count = calculator.state.battle_count,
                    "stored EMA disagrees with battle log, using replay"
                );
                true
            }
            Some(_) => false,
            None => !calculator.log.is_empty(),
        };

        calculator.phase = match calculator.last_visible_correction() {
            Some(_) => Phase::Corrected,
            None => Phase::Idle,
        };
        calculator.snapshot = calculator.restored_snapshot();

        let write = repair.then(|| StoreWrite::SaveEma {
            session_id: calculator.session.session_id.clone(),
            state: calculator.state,
        });
        (calculator, write)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn ema_state(&self) -> &EmaState {
        &self.state
    }

    pub fn log(&self) -> &[BattleRecord] {
        &self.log
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn snapshot(&self) -> &MoeSnapshot {
        &self.snapshot
    }

    /// Record the server-side battle count this session is anchored to.
    pub fn set_stats_baseline(&mut self, battles: u64) -> Option<StoreWrite> {
        if self.session.stats_baseline == Some(battles) {
            return None;
        }
        self.session.stats_baseline = Some(battles);
        Some(StoreWrite::UpdateSession(self.session.clone()))
    }

    pub fn in_battle(&self) -> bool {
        matches!(self.phase, Phase::InBattle { .. })
    }

    pub fn on_battle_started(&mut self, damage: u64) -> Transition {
        if self.in_battle() {
            return Transition::default();
        }
        self.phase = Phase::InBattle {
            battle_id: BattleId::new(),
        };
        self.live_damage = damage;
        self.publish(SnapshotStatus::InBattle, damage, 0.0)
    }

    pub fn on_damage_updated(&mut self, damage: u64) -> Transition {
        if !self.in_battle() {
            return Transition::default();
        }
        self.live_damage = damage;
        self.publish(SnapshotStatus::InBattle, damage, 0.0)
    }

    /// Close the battle with its local estimate and ask for a correction.
    pub fn on_battle_ended(&mut self, final_damage: u64, ended_at: DateTime<Utc>) -> Transition {
        let battle_id = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::InBattle { battle_id } => battle_id,
            _ => BattleId::new(),
        };
        let seq = self.log.len() as u32 + 1;
        let record = BattleRecord::estimated(
            battle_id.clone(),
            self.session.session_id.clone(),
            seq,
            final_damage,
            ended_at,
        );

        let before = self.percent(&self.state);
        self.state = self
            .ema
            .update_from(self.session.seed_average, &self.state, final_damage);
        self.log.push(record.clone());
        self.live_damage = 0;
        self.phase = Phase::AwaitingCorrection {
            battle_id: battle_id.clone(),
        };
        let delta = self.percent(&self.state) - before;

        let mut transition = self.publish(SnapshotStatus::Idle, final_damage, delta);
        transition.writes = vec![
            StoreWrite::AppendBattle(record),
            StoreWrite::SaveEma {
                session_id: self.session.session_id.clone(),
                state: self.state,
            },
        ];
        transition.correction = Some(CorrectionRequest {
            battle_id,
            session_id: self.session.session_id.clone(),
            tank_id: self.session.tank_id,
            seq,
        });
        transition
    }

    /// Replace a battle's estimate with its authoritative value.
    pub fn apply_correction(
        &mut self,
        battle_id: &BattleId,
        value: u64,
        at: DateTime<Utc>,
    ) -> (CorrectionOutcome, Transition) {
        let Some(index) = self.log.iter().position(|b| &b.battle_id == battle_id) else {
            return (CorrectionOutcome::Stale, Transition::default());
        };
        if self.log[index].is_corrected() {
            return (CorrectionOutcome::Duplicate, Transition::default());
        }

        // Never order a correction before the battle close it follows.
        let at = self
            .log
            .iter()
            .fold(at, |latest, b| latest.max(b.ended_at));
        let corrected = self.log[index].corrected(value, at);
        self.log[index] = corrected.clone();

        let before = self.percent(&self.state);
        self.state = self.replay_log();
        let delta = self.percent(&self.state) - before;

        let mut transition = if self.in_battle() {
            self.publish(SnapshotStatus::InBattle, self.live_damage, delta)
        } else {
            let still_waiting = matches!(
                &self.phase,
                Phase::AwaitingCorrection { battle_id: pending } if pending != battle_id
            );
            if !still_waiting {
                self.phase = Phase::Corrected;
            }
            self.publish(SnapshotStatus::Corrected, value, delta)
        };
        transition.writes = vec![
            StoreWrite::UpdateBattle(corrected),
            StoreWrite::SaveEma {
                session_id: self.session.session_id.clone(),
                state: self.state,
            },
        ];
        (CorrectionOutcome::Applied, transition)
    }

    /// The estimate stands for good. Nothing is published.
    pub fn correction_failed(&mut self, battle_id: &BattleId) {
        if matches!(&self.phase, Phase::AwaitingCorrection { battle_id: pending } if pending == battle_id)
        {
            self.phase = Phase::Idle;
        }
    }

    /// Re-derive percentages against a new damage target. History is untouched.
    pub fn set_target(&mut self, target: f64) -> Transition {
        let before = self.percent(&self.state);
        self.target = target;
        let delta = self.percent(&self.state) - before;
        let status = self.snapshot.status;
        let combined = self.snapshot.combined_damage;
        self.publish(status, combined, delta)
    }

    // -- internals -----------------------------------------------------------

    fn percent(&self, state: &EmaState) -> f64 {
        moe_percent(state.average, self.target)
    }

    fn replay_log(&self) -> EmaState {
        self.replay(self.log.iter().map(|b| b.combined_damage))
    }

    fn replay<I>(&self, values: I) -> EmaState
    where
        I: IntoIterator<Item = u64>,
    {
        self.ema.replay_from(self.session.seed_average, values)
    }

    fn compose(&self, status: SnapshotStatus, combined_damage: u64, delta: f64) -> MoeSnapshot {
        let moe = self.percent(&self.state);
        let in_battle = self.in_battle();
        let projected = if in_battle {
            moe_percent(self.ema.project(&self.state, self.live_damage), self.target)
        } else {
            moe
        };
        MoeSnapshot {
            tank_name: self.session.tank_name.clone(),
            moe_percent: moe,
            projected_moe_percent: projected,
            combined_damage,
            delta,
            in_battle,
            status,
        }
    }

    fn publish(&mut self, status: SnapshotStatus, combined_damage: u64, delta: f64) -> Transition {
        let snapshot = self.compose(status, combined_damage, delta);
        self.snapshot = snapshot.clone();
        Transition {
            snapshot: Some(snapshot),
            ..Transition::default()
        }
    }

    /// Index of the most recent correction, if it landed after the last
    /// battle closed and so produced the last published snapshot.
    fn last_visible_correction(&self) -> Option<usize> {
        let last_close = self.log.last()?.ended_at;
        self.log
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.corrected_at.map(|at| (at, i)))
            .filter(|(at, _)| *at >= last_close)
            .max_by_key(|(at, _)| *at)
            .map(|(_, i)| i)
    }

    /// The snapshot that was current after the last battle close or
    /// correction, whichever came later.
    fn restored_snapshot(&self) -> MoeSnapshot {
        let Some(last) = self.log.last() else {
            return self.compose(SnapshotStatus::Idle, 0, 0.0);
        };

        if let Some(index) = self.last_visible_correction() {
            let corrected = &self.log[index];
            let as_estimated = self.replay(self.log.iter().enumerate().map(|(i, b)| {
                if i == index {
                    b.estimated_damage
                } else {
                    b.combined_damage
                }
            }));
            let delta = self.percent(&self.state) - self.percent(&as_estimated);
            return self.compose(SnapshotStatus::Corrected, corrected.combined_damage, delta);
        }

        let head = &self.log[..self.log.len() - 1];
        let without_last = self.replay(head.iter().map(|b| b.combined_damage));
        let delta = self.percent(&self.state) - self.percent(&without_last);
        self.compose(SnapshotStatus::Idle, last.combined_damage, delta)
    }
}

fn same_state(a: &EmaState, b: &EmaState) -> bool {
    a.battle_count == b.battle_count
        && (a.average - b.average).abs() <= 1e-9 * a.average.abs().max(1.0)
}
