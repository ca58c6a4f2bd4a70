//! Exponential moving average over per-battle combined damage.
//!
//! The in-game mark percentage is driven by an EMA over roughly the last
//! hundred battles, so the default smoothing factor is `2 / (100 + 1)`.

use moe_state::EmaState;
use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};

/// Default smoothing factor for a ~100 battle window.
pub const DEFAULT_ALPHA: f64 = 2.0 / 101.0;

/// Search cap for [`EmaCalculator::battles_to_target`].
pub const MAX_PROJECTED_BATTLES: u32 = 500;

/// Outcome of a battles-to-target projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "battles")]
pub enum BattlesToTarget {
    /// Target reached after this many battles (0 = already there).
    Reached(u32),
    /// Never reached at the given per-battle damage.
    Unreachable,
}

/// Pure EMA math with a fixed alpha.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaCalculator {
    alpha: f64,
}

impl EmaCalculator {
    /// Create a calculator. `alpha` must lie strictly inside (0, 1).
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(MoeError::InvalidAlpha(alpha));
        }
        Ok(Self { alpha })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// State with no battles yet, bound to this calculator's alpha.
    pub fn empty(&self) -> EmaState {
        EmaState::empty(self.alpha)
    }

    /// Starting state. With a seed the average begins there instead of at
    /// the first battle.
    pub fn start(&self, seed: Option<f64>) -> EmaState {
        EmaState {
            average: seed.unwrap_or(0.0),
            ..self.empty()
        }
    }

    /// Fold one battle's combined damage into the average.
    ///
    /// The first battle seeds the average directly.
    pub fn update(&self, state: &EmaState, value: u64) -> EmaState {
        self.update_from(None, state, value)
    }

    /// Like [`update`](Self::update), but a seeded state blends its first
    /// battle into the seed instead of replacing it.
    pub fn update_from(&self, seed: Option<f64>, state: &EmaState, value: u64) -> EmaState {
        let value = value as f64;
        let average = match (state.battle_count, seed) {
            (0, None) => value,
            (0, Some(prior)) => prior + self.alpha * (value - prior),
            _ => state.average + self.alpha * (value - state.average),
        };
        EmaState {
            average,
            battle_count: state.battle_count + 1,
            alpha: self.alpha,
        }
    }

    /// Live projection during a battle: never below the current damage.
    pub fn project(&self, state: &EmaState, current: u64) -> f64 {
        state.average.max(current as f64)
    }

    /// Rebuild a state from scratch by folding every value in order.
    pub fn replay<I>(&self, values: I) -> EmaState
    where
        I: IntoIterator<Item = u64>,
    {
        self.replay_from(None, values)
    }

    pub fn replay_from<I>(&self, seed: Option<f64>, values: I) -> EmaState
    where
        I: IntoIterator<Item = u64>,
    {
        values
            .into_iter()
            .fold(self.start(seed), |state, value| self.update_from(seed, &state, value))
    }

    /// Smallest number of battles at `per_battle` damage after which the
    /// average reaches `target`.
    pub fn battles_to_target(
        &self,
        seed: Option<f64>,
        state: &EmaState,
        target: f64,
        per_battle: u64,
    ) -> BattlesToTarget {
        let has_history = state.battle_count > 0 || seed.is_some();
        if has_history && state.average >= target {
            return BattlesToTarget::Reached(0);
        }
        // The average converges towards per_battle from below and never passes it.
        if (per_battle as f64) < target {
            return BattlesToTarget::Unreachable;
        }

        let mut projected = *state;
        for n in 1..=MAX_PROJECTED_BATTLES {
            projected = self.update_from(seed, &projected, per_battle);
            if projected.average >= target {
                return BattlesToTarget::Reached(n);
            }
        }
        BattlesToTarget::Unreachable
    }
}

impl Default for EmaCalculator {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc(alpha: f64) -> EmaCalculator {
        EmaCalculator::new(alpha).unwrap()
    }

    #[test]
    fn rejects_alpha_outside_open_interval() {
        for alpha in [0.0, 1.0, -0.2, 1.5, f64::NAN] {
            assert!(matches!(
                EmaCalculator::new(alpha),
                Err(MoeError::InvalidAlpha(_))
            ));
        }
    }

    #[test]
    fn first_battle_seeds_average() {
        let ema = calc(0.3);
        let state = ema.update(&ema.empty(), 820);
        assert_eq!(state.average, 820.0);
        assert_eq!(state.battle_count, 1);
    }

    #[test]
    fn subsequent_battles_blend() {
        let ema = calc(0.3);
        let state = ema.replay([1000, 2000]);
        assert!((state.average - 1300.0).abs() < 1e-9);
        assert_eq!(state.battle_count, 2);
    }

    #[test]
    fn constant_input_converges() {
        let ema = calc(0.3);
        let mut state = ema.update(&ema.empty(), 0);
        for _ in 0..200 {
            state = ema.update(&state, 1500);
        }
        assert!((state.average - 1500.0).abs() < 1e-6);
    }

    #[test]
    fn projection_is_never_below_current_damage() {
        let ema = calc(0.3);
        let state = ema.replay([1000]);
        assert_eq!(ema.project(&state, 400), 1000.0);
        assert_eq!(ema.project(&state, 2500), 2500.0);
        assert_eq!(ema.project(&ema.empty(), 150), 150.0);
    }

    #[test]
    fn replay_matches_incremental_updates() {
        let ema = calc(0.3);
        let values = [820, 600, 1400, 0, 2200];
        let mut incremental = ema.empty();
        for v in values {
            incremental = ema.update(&incremental, v);
        }
        assert_eq!(ema.replay(values), incremental);
    }

    #[test]
    fn battles_to_target_counts_iterations() {
        let ema = calc(0.5);
        let state = ema.replay([1000]);
        // 1000 -> 1500 -> 1750 -> 1875 ...
        assert_eq!(
            ema.battles_to_target(None, &state, 1750.0, 2000),
            BattlesToTarget::Reached(2)
        );
    }

    #[test]
    fn battles_to_target_already_reached() {
        let ema = calc(0.3);
        let state = ema.replay([2500]);
        assert_eq!(
            ema.battles_to_target(None, &state, 2000.0, 0),
            BattlesToTarget::Reached(0)
        );
    }

    #[test]
    fn battles_to_target_empty_history_needs_one_battle() {
        let ema = calc(0.3);
        assert_eq!(
            ema.battles_to_target(None, &ema.empty(), 2000.0, 2100),
            BattlesToTarget::Reached(1)
        );
    }

    #[test]
    fn battles_to_target_unreachable_below_target() {
        let ema = calc(0.3);
        let state = ema.replay([1000]);
        assert_eq!(
            ema.battles_to_target(None, &state, 2000.0, 1999),
            BattlesToTarget::Unreachable
        );
    }

    #[test]
    fn seed_counts_as_prior_history() {
        let ema = calc(0.5);
        let start = ema.start(Some(1600.0));
        assert_eq!(start.average, 1600.0);
        assert_eq!(start.battle_count, 0);

        let state = ema.update_from(Some(1600.0), &start, 1000);
        assert_eq!(state.average, 1300.0);
        assert_eq!(state.battle_count, 1);
        assert_eq!(ema.replay_from(Some(1600.0), [1000, 2000]).average, 1650.0);
    }

    #[test]
    fn unseeded_replay_still_seeds_from_first_battle() {
        let ema = calc(0.3);
        assert_eq!(ema.replay_from(None, [820]), ema.replay([820]));
    }

    #[test]
    fn battles_to_target_from_seed() {
        let ema = calc(0.5);
        let seed = Some(2100.0);
        assert_eq!(
            ema.battles_to_target(seed, &ema.start(seed), 2000.0, 0),
            BattlesToTarget::Reached(0)
        );
        let seed = Some(1000.0);
        // 1000 -> 1500 -> 1750
        assert_eq!(
            ema.battles_to_target(seed, &ema.start(seed), 1750.0, 2000),
            BattlesToTarget::Reached(2)
        );
    }

    #[test]
    fn battles_to_target_serializes_tagged() {
        let json = serde_json::to_value(BattlesToTarget::Reached(3)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "reached", "battles": 3}));
    }
}
