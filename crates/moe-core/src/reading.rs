//! Damage observations and the sources that produce them.
//!
//! The engine never looks at pixels: something upstream (screen capture,
//! a replay file, a test) turns frames into [`DamageReading`]s and exposes
//! them through a [`ReadingSource`]. The poller filters them before they
//! reach the single-writer engine queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One combined-damage observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DamageReading {
    pub value: u64,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
    /// Recognition confidence in `[0, 1]`.
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

impl DamageReading {
    pub fn new(value: u64, observed_at: DateTime<Utc>, confidence: f64) -> Self {
        Self {
            value,
            observed_at,
            confidence,
        }
    }

    /// A fully-confident reading taken now.
    pub fn now(value: u64) -> Self {
        Self::new(value, Utc::now(), 1.0)
    }
}

/// Why a reading never reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    LowConfidence,
    /// Older than a reading that was already accepted.
    Stale,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::LowConfidence => "low_confidence",
            DropReason::Stale => "stale",
        }
    }
}

/// Drops low-confidence and out-of-order readings.
#[derive(Debug, Clone)]
pub struct ReadingFilter {
    min_confidence: f64,
    last_accepted: Option<DateTime<Utc>>,
}

impl ReadingFilter {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence,
            last_accepted: None,
        }
    }

    pub fn check(&mut self, reading: &DamageReading) -> Result<(), DropReason> {
        if reading.confidence < self.min_confidence {
            return Err(DropReason::LowConfidence);
        }
        if let Some(last) = self.last_accepted {
            if reading.observed_at < last {
                return Err(DropReason::Stale);
            }
        }
        self.last_accepted = Some(reading.observed_at);
        Ok(())
    }
}

/// Non-blocking source of readings, polled once per sample tick.
///
/// `None` means "no observation this tick", never zero damage.
pub trait ReadingSource: Send + 'static {
    fn poll(&mut self) -> Option<DamageReading>;
}

/// Source fed through a tokio channel (stdin readers, tests).
pub struct ChannelSource {
    rx: mpsc::Receiver<DamageReading>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<DamageReading>) -> Self {
        Self { rx }
    }

    /// Create a bounded channel and the source draining it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<DamageReading>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

impl ReadingSource for ChannelSource {
    fn poll(&mut self) -> Option<DamageReading> {
        self.rx.try_recv().ok()
    }
}
