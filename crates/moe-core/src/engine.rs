//! The single-writer engine task.
//!
//! All tracker state lives in one tokio task. Readings, correction results,
//! tank switches and queries arrive as [`EngineCommand`]s and are processed
//! strictly one at a time, so every published snapshot reflects a
//! consistent state. Store writes go through the write-behind [`Persister`];
//! corrections run as independent tasks owned by the
//! [`CorrectionCoordinator`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moe_state::{EmaState, Session, SessionId, SessionStore, TankId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use crate::battle_detector::{BattleDetector, BattleEvent};
use crate::broadcast::{StateBroadcaster, Subscription};
use crate::calculator::{CorrectionOutcome, MoeCalculator, Phase, Transition};
use crate::config::TrackerConfig;
use crate::correction::{CorrectionCompletion, CorrectionCoordinator, CorrectionResult};
use crate::ema::EmaCalculator;
use crate::error::{MoeError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::persist::{Persister, StoreWrite};
use crate::providers::ResultProvider;
use crate::reading::DamageReading;
use crate::snapshot::MoeSnapshot;

const COMMAND_CAPACITY: usize = 256;

/// Everything the engine task can be asked to do.
#[derive(Debug)]
pub enum EngineCommand {
    Observe(DamageReading),
    /// No reading this tick; lets a silent battle go stale.
    IdleTick { at: DateTime<Utc> },
    CorrectionResolved(CorrectionCompletion),
    /// The result provider anchored a session to a server-side battle count.
    StatsBaseline {
        session_id: SessionId,
        battles: u64,
    },
    SwitchTank {
        tank: TankSelection,
        reply: oneshot::Sender<Session>,
    },
    SetTarget(f64),
    Snapshot(oneshot::Sender<MoeSnapshot>),
    Status(oneshot::Sender<EngineStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// The tank to track and its damage target.
#[derive(Debug, Clone, PartialEq)]
pub struct TankSelection {
    pub tank_id: TankId,
    pub tank_name: String,
    pub target: f64,
    /// Mark percentage the player already has on this tank.
    pub starting_moe: Option<f64>,
}

impl TankSelection {
    pub fn new(tank_id: TankId, tank_name: impl Into<String>, target: f64) -> Self {
        Self {
            tank_id,
            tank_name: tank_name.into(),
            target,
            starting_moe: None,
        }
    }

    pub fn with_starting_moe(mut self, percent: Option<f64>) -> Self {
        self.starting_moe = percent;
        self
    }

    /// Average combined damage matching the starting percentage.
    pub fn seed_average(&self) -> Option<f64> {
        let percent = self.starting_moe?;
        (self.target > 0.0 && (0.0..=100.0).contains(&percent))
            .then(|| percent / 100.0 * self.target)
    }

    fn new_session(&self) -> Session {
        Session::new(self.tank_id, self.tank_name.clone()).with_seed_average(self.seed_average())
    }
}

/// Point-in-time view of the engine internals.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub session: Session,
    pub snapshot: MoeSnapshot,
    pub ema: EmaState,
    pub target: f64,
    pub battles: usize,
    pub awaiting_correction: bool,
    pub corrections_in_flight: usize,
    pub pending_writes: u64,
    pub store_degraded: bool,
}

/// Cheap, clone-able handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    broadcaster: StateBroadcaster,
}

impl EngineHandle {
    /// Queue a reading, waiting for room if the queue is full.
    pub async fn observe(&self, reading: DamageReading) -> Result<()> {
        self.send(EngineCommand::Observe(reading)).await
    }

    /// Queue a reading without waiting. Returns `false` if it was not queued.
    pub fn try_observe(&self, reading: DamageReading) -> bool {
        self.tx.try_send(EngineCommand::Observe(reading)).is_ok()
    }

    pub fn try_idle_tick(&self, at: DateTime<Utc>) -> bool {
        self.tx.try_send(EngineCommand::IdleTick { at }).is_ok()
    }

    pub async fn idle_tick(&self, at: DateTime<Utc>) -> Result<()> {
        self.send(EngineCommand::IdleTick { at }).await
    }

    /// Retire the current session and start tracking another tank.
    pub async fn switch_tank(&self, tank: TankSelection) -> Result<Session> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::SwitchTank { tank, reply }).await?;
        rx.await.map_err(|_| MoeError::EngineClosed)
    }

    pub async fn set_target(&self, target: f64) -> Result<()> {
        if !(target >= 0.0 && target.is_finite()) {
            return Err(MoeError::InvalidConfig(format!(
                "damage target must be a non-negative number, got {}",
                target
            )));
        }
        self.send(EngineCommand::SetTarget(target)).await
    }

    /// Current snapshot, after every command queued before this call.
    pub async fn snapshot(&self) -> Result<MoeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| MoeError::EngineClosed)
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Status(reply)).await?;
        rx.await.map_err(|_| MoeError::EngineClosed)
    }

    /// `true` once the engine task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// Stop the engine once every queued command has been handled.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown(ack)).await?;
        rx.await.map_err(|_| MoeError::EngineClosed)
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| MoeError::EngineClosed)
    }
}

pub struct Engine {
    ema: EmaCalculator,
    calculator: MoeCalculator,
    detector: BattleDetector,
    persister: Persister,
    coordinator: CorrectionCoordinator,
    broadcaster: StateBroadcaster,
    flush_timeout: Duration,
    commands: mpsc::Receiver<EngineCommand>,
    completions: mpsc::Receiver<EngineCommand>,
}

impl Engine {
    /// Restore or start a session and spawn the engine task.
    ///
    /// The stored session is resumed when it tracks the selected tank;
    /// otherwise a fresh session is started and made durable before the
    /// engine accepts any reading.
    pub async fn spawn(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn ResultProvider>,
        config: &TrackerConfig,
        tank: TankSelection,
    ) -> Result<(EngineHandle, JoinHandle<()>)> {
        config.validate()?;
        let ema = config.ema()?;

        let (calculator, repair, restored) = match store.load().await? {
            Some(stored) if stored.session.tank_id == tank.tank_id => {
                let restored = stored.battles.len();
                let (calculator, repair) = MoeCalculator::restore(ema, stored, tank.target);
                (calculator, repair, restored)
            }
            _ => {
                let session = tank.new_session();
                store.start_session(&session).await?;
                (MoeCalculator::new(ema, session, tank.target), None, 0)
            }
        };

        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (completion_tx, completions) = mpsc::channel(COMMAND_CAPACITY);

        let persister = Persister::spawn(store, config.persistence.clone());
        if let Some(write) = repair {
            persister.enqueue(write);
        }
        let coordinator =
            CorrectionCoordinator::new(provider, config.correction.clone(), completion_tx);
        coordinator.prepare_session(calculator.session().clone(), restored as u32);
        let broadcaster = StateBroadcaster::new(calculator.snapshot().clone());

        let session = calculator.session();
        obs::emit_session_started(&session.session_id.0, &session.tank_name, restored);

        let engine = Engine {
            ema,
            calculator,
            detector: BattleDetector::new(config.detector_config()),
            persister,
            coordinator,
            broadcaster: broadcaster.clone(),
            flush_timeout: config.flush_timeout(),
            commands,
            completions,
        };
        let task = tokio::spawn(engine.run());
        Ok((EngineHandle { tx, broadcaster }, task))
    }

    async fn run(mut self) {
        let mut shutdown_ack = None;

        loop {
            let command = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                Some(command) = self.completions.recv() => command,
            };

            if let EngineCommand::Shutdown(ack) = command {
                shutdown_ack = Some(ack);
                break;
            }

            let session = self.calculator.session();
            let span = obs::session_span(&session.session_id.0, session.tank_id.0);
            self.handle(command).instrument(span).await;
        }

        self.coordinator.cancel_all();
        let Engine {
            persister,
            flush_timeout,
            ..
        } = self;
        persister.shutdown(flush_timeout).await;
        METRICS.flush();
        info!("engine stopped");

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Observe(reading) => {
                if let Some(event) = self.detector.check_stale(reading.observed_at) {
                    self.on_battle_event(event).await;
                }
                if let Some(event) = self.detector.observe(&reading) {
                    self.on_battle_event(event).await;
                }
            }
            EngineCommand::IdleTick { at } => {
                if let Some(event) = self.detector.check_stale(at) {
                    self.on_battle_event(event).await;
                }
            }
            EngineCommand::CorrectionResolved(completion) => self.on_correction(completion),
            EngineCommand::StatsBaseline {
                session_id,
                battles,
            } => {
                if session_id != self.calculator.session().session_id {
                    debug!(session_id = %session_id, "stats baseline for retired session");
                } else if let Some(write) = self.calculator.set_stats_baseline(battles) {
                    debug!(battles, "stats baseline recorded");
                    self.persister.enqueue(write);
                }
            }
            EngineCommand::SwitchTank { tank, reply } => {
                let session = self.switch_tank(tank);
                let _ = reply.send(session);
            }
            EngineCommand::SetTarget(target) => {
                let transition = self.calculator.set_target(target);
                self.apply(transition);
            }
            EngineCommand::Snapshot(reply) => {
                let _ = reply.send(self.calculator.snapshot().clone());
            }
            EngineCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            EngineCommand::Shutdown(ack) => {
                let _ = ack.send(());
            }
        }
    }

    async fn on_battle_event(&mut self, event: BattleEvent) {
        match event {
            BattleEvent::Started { damage, .. } => {
                let transition = self.calculator.on_battle_started(damage);
                if let Phase::InBattle { battle_id } = self.calculator.phase() {
                    obs::emit_battle_started(&battle_id.0, damage);
                }
                self.apply(transition);
            }
            BattleEvent::DamageUpdated { damage, .. } => {
                let transition = self.calculator.on_damage_updated(damage);
                self.apply(transition);
            }
            BattleEvent::Ended {
                final_damage,
                at,
                reason,
            } => {
                // Let earlier writes land first; a struggling store must not stall us.
                if self.persister.pending() > 0
                    && !self.persister.is_degraded()
                    && !self.persister.flush(self.flush_timeout).await
                {
                    debug!(pending = self.persister.pending(), "store still busy at battle end");
                }

                let transition = self.calculator.on_battle_ended(final_damage, at);
                METRICS.inc_battles_closed();
                if let Some(request) = &transition.correction {
                    obs::emit_battle_ended(
                        &request.battle_id.0,
                        final_damage,
                        reason.as_str(),
                        self.calculator.snapshot().moe_percent,
                    );
                }
                self.apply(transition);
            }
        }
    }

    fn on_correction(&mut self, completion: CorrectionCompletion) {
        let CorrectionCompletion { request, result } = completion;
        let battle_id = request.battle_id;
        self.coordinator.complete(&battle_id);

        if request.session_id != self.calculator.session().session_id {
            METRICS.inc_corrections_discarded();
            obs::emit_correction_discarded(&battle_id.0, "session retired");
            return;
        }

        match result {
            CorrectionResult::Resolved { value, .. } => {
                let estimated = self
                    .calculator
                    .log()
                    .iter()
                    .find(|b| b.battle_id == battle_id)
                    .map(|b| b.estimated_damage);
                let (outcome, transition) = self
                    .calculator
                    .apply_correction(&battle_id, value, Utc::now());
                match outcome {
                    CorrectionOutcome::Applied => {
                        METRICS.inc_corrections_applied();
                        obs::emit_correction_applied(
                            &battle_id.0,
                            estimated.unwrap_or(value),
                            value,
                            self.calculator.snapshot().moe_percent,
                        );
                        self.apply(transition);
                    }
                    CorrectionOutcome::Duplicate => {
                        METRICS.inc_corrections_discarded();
                        obs::emit_correction_discarded(&battle_id.0, "already corrected");
                    }
                    CorrectionOutcome::Stale => {
                        METRICS.inc_corrections_discarded();
                        obs::emit_correction_discarded(&battle_id.0, "unknown battle");
                    }
                }
            }
            CorrectionResult::Failed(failure) => {
                self.calculator.correction_failed(&battle_id);
                METRICS.inc_corrections_failed();
                obs::emit_correction_failed(&battle_id.0, failure.attempts(), &failure);
            }
        }
    }

    fn switch_tank(&mut self, tank: TankSelection) -> Session {
        let previous = self.calculator.session().clone();
        let cancelled = self.coordinator.cancel_session(&previous.session_id);
        self.detector.reset();

        let session = tank.new_session();
        self.persister
            .enqueue(StoreWrite::StartSession(session.clone()));
        self.calculator = MoeCalculator::new(self.ema, session.clone(), tank.target);
        self.coordinator.prepare_session(session.clone(), 0);

        obs::emit_tank_switched(&previous.tank_name, &session.tank_name, cancelled);
        self.broadcaster.publish(self.calculator.snapshot().clone());
        session
    }

    /// Enqueue writes, schedule the correction, then publish.
    fn apply(&mut self, transition: Transition) {
        let Transition {
            snapshot,
            writes,
            correction,
        } = transition;

        for write in writes {
            self.persister.enqueue(write);
        }
        if let Some(request) = correction {
            self.coordinator.schedule(request);
        }
        if let Some(snapshot) = snapshot {
            self.broadcaster.publish(snapshot);
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            session: self.calculator.session().clone(),
            snapshot: self.calculator.snapshot().clone(),
            ema: *self.calculator.ema_state(),
            target: self.calculator.target(),
            battles: self.calculator.log().len(),
            awaiting_correction: matches!(
                self.calculator.phase(),
                Phase::AwaitingCorrection { .. }
            ),
            corrections_in_flight: self.coordinator.in_flight(),
            pending_writes: self.persister.pending(),
            store_degraded: self.persister.is_degraded(),
        }
    }
}
