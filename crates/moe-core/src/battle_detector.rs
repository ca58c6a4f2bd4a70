//! Battle boundary detection over the reading stream.
//!
//! ```text
//! Idle --value > 0--> Active                    emits Started
//! Active --value >= peak--> Active              emits DamageUpdated if it grew
//! Active --0 < value < peak--> Active           glitch, ignored
//! Active --confirmed zero | stale--> Idle       emits Ended(peak)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reading::DamageReading;

/// Detector tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Without any reading for this long, an active battle is closed.
    pub staleness: Duration,
    /// Consecutive zero readings needed to confirm a battle end.
    pub zero_readings_to_end: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(60),
            zero_readings_to_end: 1,
        }
    }
}

/// Why an active battle was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ZeroConfirmed,
    Stale,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ZeroConfirmed => "zero_confirmed",
            EndReason::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleEvent {
    Started {
        damage: u64,
        at: DateTime<Utc>,
    },
    DamageUpdated {
        damage: u64,
        at: DateTime<Utc>,
    },
    Ended {
        final_damage: u64,
        at: DateTime<Utc>,
        reason: EndReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Idle,
    Active {
        last_damage: u64,
        peak_damage: u64,
        last_seen_at: DateTime<Utc>,
        zero_streak: u32,
    },
}

/// State machine turning readings into battle events.
#[derive(Debug, Clone)]
pub struct BattleDetector {
    config: DetectorConfig,
    state: DetectorState,
}

impl BattleDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: DetectorState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, DetectorState::Active { .. })
    }

    /// Highest accepted damage of the open battle.
    pub fn peak_damage(&self) -> Option<u64> {
        match self.state {
            DetectorState::Active { peak_damage, .. } => Some(peak_damage),
            DetectorState::Idle => None,
        }
    }

    /// Forget any open battle without emitting an end (tank switch).
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
    }

    pub fn observe(&mut self, reading: &DamageReading) -> Option<BattleEvent> {
        let at = reading.observed_at;
        let value = reading.value;

        match &mut self.state {
            DetectorState::Idle => {
                if value == 0 {
                    return None;
                }
                self.state = DetectorState::Active {
                    last_damage: value,
                    peak_damage: value,
                    last_seen_at: at,
                    zero_streak: 0,
                };
                Some(BattleEvent::Started { damage: value, at })
            }
            DetectorState::Active {
                last_damage,
                peak_damage,
                last_seen_at,
                zero_streak,
            } => {
                *last_seen_at = at;
                *last_damage = value;

                if value == 0 {
                    *zero_streak += 1;
                    if *zero_streak < self.config.zero_readings_to_end.max(1) {
                        return None;
                    }
                    let final_damage = *peak_damage;
                    self.state = DetectorState::Idle;
                    return Some(BattleEvent::Ended {
                        final_damage,
                        at,
                        reason: EndReason::ZeroConfirmed,
                    });
                }

                *zero_streak = 0;
                if value > *peak_damage {
                    *peak_damage = value;
                    Some(BattleEvent::DamageUpdated { damage: value, at })
                } else {
                    // Equal: nothing new. Lower: misread, peak stands.
                    None
                }
            }
        }
    }

    /// Close the battle if nothing has been observed for the staleness window.
    pub fn check_stale(&mut self, now: DateTime<Utc>) -> Option<BattleEvent> {
        let DetectorState::Active {
            peak_damage,
            last_seen_at,
            ..
        } = self.state
        else {
            return None;
        };

        let stale = (now - last_seen_at)
            .to_std()
            .map(|elapsed| elapsed >= self.config.staleness)
            .unwrap_or(false);
        if !stale {
            return None;
        }

        self.state = DetectorState::Idle;
        Some(BattleEvent::Ended {
            final_damage: peak_damage,
            at: now,
            reason: EndReason::Stale,
        })
    }
}

impl Default for BattleDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn feed(detector: &mut BattleDetector, values: &[u64]) -> Vec<Option<BattleEvent>> {
        let start = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let at = start + ChronoDuration::milliseconds(500 * i as i64);
                detector.observe(&DamageReading::new(*v, at, 1.0))
            })
            .collect()
    }

    #[test]
    fn single_ramp_yields_one_start_and_one_end() {
        let mut detector = BattleDetector::default();
        let events = feed(&mut detector, &[0, 150, 400, 820, 820, 0]);

        assert!(events[0].is_none());
        assert!(matches!(
            events[1],
            Some(BattleEvent::Started { damage: 150, .. })
        ));
        assert!(matches!(
            events[2],
            Some(BattleEvent::DamageUpdated { damage: 400, .. })
        ));
        assert!(matches!(
            events[3],
            Some(BattleEvent::DamageUpdated { damage: 820, .. })
        ));
        assert!(events[4].is_none(), "unchanged value emits nothing");
        assert!(matches!(
            events[5],
            Some(BattleEvent::Ended {
                final_damage: 820,
                reason: EndReason::ZeroConfirmed,
                ..
            })
        ));
        assert!(!detector.is_active());
    }

    #[test]
    fn updates_are_monotone() {
        let mut detector = BattleDetector::default();
        let events = feed(&mut detector, &[100, 300, 250, 500, 480, 900, 0]);
        let updates: Vec<u64> = events
            .iter()
            .flatten()
            .filter_map(|e| match e {
                BattleEvent::DamageUpdated { damage, .. } => Some(*damage),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![300, 500, 900]);
    }

    #[test]
    fn decrease_does_not_reset_peak() {
        let mut detector = BattleDetector::default();
        feed(&mut detector, &[500, 1200, 40]);
        assert!(detector.is_active());
        assert_eq!(detector.peak_damage(), Some(1200));
    }

    #[test]
    fn zero_confirmation_count_is_respected() {
        let mut detector = BattleDetector::new(DetectorConfig {
            zero_readings_to_end: 3,
            ..DetectorConfig::default()
        });
        let events = feed(&mut detector, &[700, 0, 0, 800, 0, 0, 0]);
        assert!(events[1].is_none() && events[2].is_none());
        assert!(matches!(
            events[3],
            Some(BattleEvent::DamageUpdated { damage: 800, .. })
        ));
        let ends: Vec<_> = events
            .iter()
            .flatten()
            .filter(|e| matches!(e, BattleEvent::Ended { .. }))
            .collect();
        assert_eq!(ends.len(), 1);
        assert!(matches!(
            events[6],
            Some(BattleEvent::Ended {
                final_damage: 800,
                ..
            })
        ));
    }

    #[test]
    fn stale_battle_ends_with_peak() {
        let mut detector = BattleDetector::new(DetectorConfig {
            staleness: Duration::from_secs(30),
            zero_readings_to_end: 1,
        });
        let start = Utc::now();
        detector.observe(&DamageReading::new(640, start, 1.0));

        assert!(detector
            .check_stale(start + ChronoDuration::seconds(29))
            .is_none());
        let ended = detector.check_stale(start + ChronoDuration::seconds(30));
        assert!(matches!(
            ended,
            Some(BattleEvent::Ended {
                final_damage: 640,
                reason: EndReason::Stale,
                ..
            })
        ));
        assert!(detector
            .check_stale(start + ChronoDuration::seconds(90))
            .is_none());
    }

    #[test]
    fn glitch_reading_keeps_battle_fresh() {
        let mut detector = BattleDetector::new(DetectorConfig {
            staleness: Duration::from_secs(30),
            zero_readings_to_end: 1,
        });
        let start = Utc::now();
        detector.observe(&DamageReading::new(640, start, 1.0));
        detector.observe(&DamageReading::new(
            10,
            start + ChronoDuration::seconds(20),
            1.0,
        ));
        assert!(detector
            .check_stale(start + ChronoDuration::seconds(40))
            .is_none());
    }

    #[test]
    fn idle_ignores_zero_and_staleness() {
        let mut detector = BattleDetector::default();
        assert!(feed(&mut detector, &[0, 0, 0]).iter().all(Option::is_none));
        assert!(detector
            .check_stale(Utc::now() + ChronoDuration::hours(1))
            .is_none());
    }

    #[test]
    fn reset_discards_open_battle() {
        let mut detector = BattleDetector::default();
        feed(&mut detector, &[300]);
        detector.reset();
        assert!(!detector.is_active());
        assert!(feed(&mut detector, &[0])[0].is_none());
    }
}
