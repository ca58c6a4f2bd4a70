//! Fixed-rate sampling of a [`ReadingSource`] into the engine queue.
//!
//! One reading is taken per tick. Readings that fail the filter are counted
//! and dropped here; the rest are offered to the engine without blocking, so
//! a busy engine costs samples, never sampling cadence.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::engine::EngineHandle;
use crate::metrics::METRICS;
use crate::obs;
use crate::reading::{ReadingFilter, ReadingSource};

/// Spawn the sampling loop. It stops once the engine is gone.
pub fn spawn_poller<S>(
    mut source: S,
    mut filter: ReadingFilter,
    engine: EngineHandle,
    interval: Duration,
) -> JoinHandle<()>
where
    S: ReadingSource,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let queued = match source.poll() {
                Some(reading) => {
                    METRICS.inc_readings_observed();
                    if let Err(reason) = filter.check(&reading) {
                        METRICS.inc_readings_dropped();
                        obs::emit_reading_dropped(reading.value, reason.as_str());
                        continue;
                    }
                    engine.try_observe(reading)
                }
                None => engine.try_idle_tick(Utc::now()),
            };

            if !queued {
                if engine.is_closed() {
                    debug!("engine gone, poller stopping");
                    break;
                }
                trace!("engine queue full, sample skipped");
            }
        }
    })
}
