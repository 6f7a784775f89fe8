//! `CoreError`: the run loop's single error type.
//!
//! One variant per advisory/surfacing condition in the error taxonomy, plus
//! the ambient configuration and I/O failure modes, wrapped via `#[from]`
//! so any collaborator's error converts at the boundary where the run loop
//! needs one type to log and continue past: each leaf error
//! (`timing::LateError`, `ecu_common::sensor::StaleSensorError`, ...)
//! derives `thiserror::Error` on its own and converts here via `#[from]`.

use ecu_common::config::ConfigError;
use ecu_common::persistence::PersistenceError;

use crate::timing::LateError;

/// Errors the control core can raise. Advisory variants are logged and
/// counted, never propagated past the run loop; `SafetyTrip` and
/// `SyncLost` additionally alter the output surface and are exposed via
/// `CoreController`'s status query.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Sensor seqlock did not settle within the retry budget; cycle skipped.
    #[error("stale sensor snapshot: {0}")]
    StaleSensor(#[from] ecu_common::sensor::StaleSensorError),

    /// A calibration table's checksum did not match; defaults were loaded.
    #[error("table checksum invalid: {0}")]
    TableInvalid(String),

    /// A scheduling target was already in the past when armed.
    #[error("late arm: {0}")]
    LateArm(#[from] LateError),

    /// Phase sync was lost or never acquired; scheduling degraded or halted.
    #[error("sync lost: {0}")]
    SyncLost(String),

    /// A safety latch is asserted; limp mode is active.
    #[error("safety trip: {0}")]
    SafetyTrip(String),

    /// A persisted write could not be completed and will retry next interval.
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] PersistenceError),

    /// A rearm was refused because it collided with a pending rise edge.
    #[error("rearm collision on channel {0:?}")]
    RearmCollision(crate::timing::Channel),

    /// Startup configuration failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An ambient I/O operation failed (outside the persistence backend's
    /// own error type, e.g. log file setup).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
