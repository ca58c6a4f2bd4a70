//! Post-battle correction: fetch the authoritative value with bounded retries.
//!
//! Every closed battle gets one independent task that asks the
//! [`ResultProvider`] for the server-side combined damage. Each attempt is
//! bounded by a timeout; failed attempts back off exponentially. The outcome
//! is posted back into the engine queue exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moe_state::{BattleId, Session, SessionId, TankId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::engine::EngineCommand;
use crate::providers::ResultProvider;

/// Identifies the battle whose authoritative value is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub battle_id: BattleId,
    pub session_id: SessionId,
    pub tank_id: TankId,
    /// Position of the battle in its session log (1-based)
    pub seq: u32,
}

/// Retry controls for correction fetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorrectionPolicy {
    /// Maximum wall-clock time for a single attempt (milliseconds).
    pub timeout_ms: u64,
    /// Maximum number of retries (0 = one attempt only).
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for CorrectionPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 5,
            backoff_base_ms: 5_000,
        }
    }
}

impl CorrectionPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrectionFailure {
    #[error("correction timed out after {attempts} attempt(s) (limit {limit_ms}ms each)")]
    Timeout { attempts: u32, limit_ms: u64 },

    #[error("correction unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },
}

impl CorrectionFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            CorrectionFailure::Timeout { attempts, .. }
            | CorrectionFailure::Unavailable { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionResult {
    Resolved { value: u64, attempts: u32 },
    Failed(CorrectionFailure),
}

/// A finished correction, as posted back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionCompletion {
    pub request: CorrectionRequest,
    pub result: CorrectionResult,
}

/// Ask the provider until it answers, gives up, or the attempts run out.
pub async fn fetch_with_retries(
    provider: &dyn ResultProvider,
    request: &CorrectionRequest,
    policy: &CorrectionPolicy,
) -> CorrectionResult {
    let max_attempts = policy.max_retries + 1;
    let limit = Duration::from_millis(policy.timeout_ms);

    for attempt in 1..=max_attempts {
        match tokio::time::timeout(limit, provider.fetch(request)).await {
            Ok(Ok(value)) => {
                return CorrectionResult::Resolved {
                    value,
                    attempts: attempt,
                }
            }
            Ok(Err(err)) if !err.is_retryable() => {
                return CorrectionResult::Failed(CorrectionFailure::Unavailable {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }
            Ok(Err(err)) => {
                debug!(battle_id = %request.battle_id, attempt, error = %err, "correction attempt failed");
                if attempt == max_attempts {
                    return CorrectionResult::Failed(CorrectionFailure::Unavailable {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
            Err(_elapsed) => {
                debug!(battle_id = %request.battle_id, attempt, "correction attempt timed out");
                if attempt == max_attempts {
                    return CorrectionResult::Failed(CorrectionFailure::Timeout {
                        attempts: attempt,
                        limit_ms: policy.timeout_ms,
                    });
                }
            }
        }
        tokio::time::sleep(policy.backoff(attempt)).await;
    }

    CorrectionResult::Failed(CorrectionFailure::Unavailable {
        attempts: max_attempts,
        reason: "exhausted all attempts".into(),
    })
}

/// Owns the in-flight correction tasks. Lives inside the engine task.
pub struct CorrectionCoordinator {
    provider: Arc<dyn ResultProvider>,
    policy: CorrectionPolicy,
    completions: mpsc::Sender<EngineCommand>,
    in_flight: HashMap<BattleId, (SessionId, AbortHandle)>,
}

impl CorrectionCoordinator {
    pub fn new(
        provider: Arc<dyn ResultProvider>,
        policy: CorrectionPolicy,
        completions: mpsc::Sender<EngineCommand>,
    ) -> Self {
        Self {
            provider,
            policy,
            completions,
            in_flight: HashMap::new(),
        }
    }

    /// Start a correction. Returns `false` if one is already outstanding
    /// for this battle.
    pub fn schedule(&mut self, request: CorrectionRequest) -> bool {
        if self.in_flight.contains_key(&request.battle_id) {
            return false;
        }

        let provider = self.provider.clone();
        let policy = self.policy.clone();
        let completions = self.completions.clone();
        let battle_id = request.battle_id.clone();
        let session_id = request.session_id.clone();

        let handle = tokio::spawn(async move {
            let result = fetch_with_retries(provider.as_ref(), &request, &policy).await;
            let completion = CorrectionCompletion { request, result };
            if completions
                .send(EngineCommand::CorrectionResolved(completion))
                .await
                .is_err()
            {
                debug!("engine stopped before correction completed");
            }
        });

        self.in_flight
            .insert(battle_id, (session_id, handle.abort_handle()));
        true
    }

    /// Forget a finished correction.
    pub fn complete(&mut self, battle_id: &BattleId) {
        self.in_flight.remove(battle_id);
    }

    /// Abort every in-flight correction of a retired session. Never blocks.
    pub fn cancel_session(&mut self, session_id: &SessionId) -> usize {
        let doomed: Vec<BattleId> = self
            .in_flight
            .iter()
            .filter(|(_, (sid, _))| sid == session_id)
            .map(|(bid, _)| bid.clone())
            .collect();
        for battle_id in &doomed {
            if let Some((_, handle)) = self.in_flight.remove(battle_id) {
                handle.abort();
            }
        }
        doomed.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.in_flight.drain() {
            handle.abort();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_scheduled(&self, battle_id: &BattleId) -> bool {
        self.in_flight.contains_key(battle_id)
    }

    /// Let the provider capture whatever baseline it needs for a session
    /// that already has `closed_battles` battles in its log. A baseline the
    /// session does not know yet is posted back to the engine.
    pub fn prepare_session(&self, session: Session, closed_battles: u32) {
        let provider = self.provider.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            match provider.prepare(&session, closed_battles).await {
                Ok(Some(battles)) if session.stats_baseline != Some(battles) => {
                    let command = EngineCommand::StatsBaseline {
                        session_id: session.session_id.clone(),
                        battles,
                    };
                    if completions.send(command).await.is_err() {
                        debug!("engine stopped before stats baseline was recorded");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(
                    session_id = %session.session_id,
                    error = %err,
                    "result provider could not prepare session"
                ),
            }
        });
    }
}
