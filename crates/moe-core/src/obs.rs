//! Structured observability hooks for tracker lifecycle events.
//!
//! This module provides:
//! - Session-scoped tracing spans via [`session_span`]
//! - Emission functions for battle, correction and persistence events
//!
//! Events are emitted at `info!` level unless noted; filter with `RUST_LOG`.

use tracing::{debug, info, warn};

/// Span carrying the session identity.
///
/// # Example
///
/// ```ignore
/// use tracing::Instrument;
/// handle(command).instrument(session_span("3f2c...", 5137)).await;
/// // Every event logged inside carries session_id and tank_id.
/// ```
pub fn session_span(session_id: &str, tank_id: u64) -> tracing::Span {
    tracing::info_span!("moe.session", session_id = %session_id, tank_id = tank_id)
}

pub fn emit_session_started(session_id: &str, tank_name: &str, restored_battles: usize) {
    info!(
        event = "session.started",
        session_id = %session_id,
        tank_name = %tank_name,
        restored_battles = restored_battles,
    );
}

pub fn emit_battle_started(battle_id: &str, damage: u64) {
    info!(event = "battle.started", battle_id = %battle_id, damage = damage);
}

/// Emit event: battle closed with its local estimate.
pub fn emit_battle_ended(battle_id: &str, final_damage: u64, reason: &str, moe_percent: f64) {
    info!(
        event = "battle.ended",
        battle_id = %battle_id,
        final_damage = final_damage,
        reason = %reason,
        moe_percent = moe_percent,
    );
}

pub fn emit_correction_applied(battle_id: &str, estimated: u64, authoritative: u64, moe_percent: f64) {
    info!(
        event = "correction.applied",
        battle_id = %battle_id,
        estimated = estimated,
        authoritative = authoritative,
        moe_percent = moe_percent,
    );
}

/// Emit event: correction gave up, estimate stands (warning level).
pub fn emit_correction_failed(battle_id: &str, attempts: u32, error: &dyn std::fmt::Display) {
    warn!(event = "correction.failed", battle_id = %battle_id, attempts = attempts, error = %error);
}

pub fn emit_correction_discarded(battle_id: &str, reason: &str) {
    debug!(event = "correction.discarded", battle_id = %battle_id, reason = %reason);
}

/// Emit event: a store write failed and will be retried (warning level).
pub fn emit_persistence_failure(kind: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(event = "persistence.write_failed", kind = %kind, attempt = attempt, error = %error);
}

/// Emit event: a store write was refused outright and dropped (warning level).
pub fn emit_persistence_rejected(kind: &str, error: &dyn std::fmt::Display) {
    warn!(event = "persistence.write_rejected", kind = %kind, error = %error);
}

pub fn emit_reading_dropped(value: u64, reason: &str) {
    debug!(event = "reading.dropped", value = value, reason = %reason);
}

pub fn emit_tank_switched(from: &str, to: &str, cancelled_corrections: usize) {
    info!(
        event = "session.tank_switched",
        from = %from,
        to = %to,
        cancelled_corrections = cancelled_corrections,
    );
}
